use thiserror::Error;

pub type Result<T> = std::result::Result<T, SidecarError>;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Certificate watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("Bootstrap failed for purpose {purpose}: {reason}")]
    Bootstrap { purpose: String, reason: String },

    #[error("Lifecycle engine error: {0}")]
    Engine(String),

    #[error("Secret {secret} is missing key {key}")]
    IncompleteSecret { secret: String, key: String },

    #[error("Reload command `{command}` exited with {status}: {output}")]
    ReloadCommand {
        command: String,
        status: String,
        output: String,
    },

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),
}
