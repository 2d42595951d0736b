//! Process-signal reload hook for the transport certificate.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{Result, SidecarError};
use crate::reload::ReloadHook;

/// Asks the resident daemon to reread its certificate files by running an
/// administrative command (`virt-admin server-update-tls libvirtd` in the
/// reference deployment) and capturing its combined output.
pub struct DaemonReloadHook {
    command: Vec<String>,
}

impl DaemonReloadHook {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ReloadHook for DaemonReloadHook {
    fn name(&self) -> &'static str {
        "daemon-signal"
    }

    async fn reload(&self) -> Result<()> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            SidecarError::InvalidConfig("reload command cannot be empty".to_string())
        })?;

        let output = Command::new(program).args(args).output().await?;
        let combined = combined_output(&output);

        if !output.status.success() {
            return Err(SidecarError::ReloadCommand {
                command: self.command.join(" "),
                status: output.status.to_string(),
                output: combined,
            });
        }

        info!(output = %combined.trim(), "daemon reloaded its TLS configuration");
        Ok(())
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}
