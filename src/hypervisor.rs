//! Hypervisor collaborator interface.
//!
//! Connections are scoped to a single hook invocation and released on drop,
//! on every exit path. The shipped implementation shells out to `virsh`
//! against the configured management endpoint, which keeps the crate free of
//! native libvirt linkage.

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::config::HypervisorConfig;
use crate::error::{Result, SidecarError};

/// A running guest capable of exposing a TLS-protected console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSession {
    pub name: String,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Open a connection to the management endpoint. Failure aborts the
    /// current hook invocation only.
    async fn connect(&self) -> Result<Box<dyn HypervisorConnection>>;
}

#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    async fn list_active_sessions(&self) -> Result<Vec<GuestSession>>;

    /// Instruct one guest to reload the TLS material of its console
    /// transport. Returns the monitor response.
    async fn display_reload(&self, session: &GuestSession) -> Result<String>;
}

/// `virsh`-backed hypervisor access.
pub struct VirshHypervisor {
    uri: String,
    binary: String,
}

impl VirshHypervisor {
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            binary: config.virsh_binary.clone(),
        }
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn connect(&self) -> Result<Box<dyn HypervisorConnection>> {
        // Cheap handshake so endpoint problems surface as connect errors
        // rather than mid-broadcast failures.
        virsh(&self.binary, &self.uri, &["hostname"]).await?;
        Ok(Box::new(VirshConnection {
            uri: self.uri.clone(),
            binary: self.binary.clone(),
        }))
    }
}

struct VirshConnection {
    uri: String,
    binary: String,
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn list_active_sessions(&self) -> Result<Vec<GuestSession>> {
        let output = virsh(&self.binary, &self.uri, &["list", "--name", "--state-running"]).await?;
        Ok(parse_session_names(&output))
    }

    async fn display_reload(&self, session: &GuestSession) -> Result<String> {
        let command = json!({
            "execute": "display-reload",
            "arguments": {
                "type": "vnc",
                "tls-certs": true,
            },
        })
        .to_string();

        virsh(
            &self.binary,
            &self.uri,
            &["qemu-monitor-command", &session.name, &command],
        )
        .await
    }
}

fn parse_session_names(output: &str) -> Vec<GuestSession> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|name| GuestSession {
            name: name.to_string(),
        })
        .collect()
}

async fn virsh(binary: &str, uri: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .arg("--connect")
        .arg(uri)
        .args(args)
        .output()
        .await
        .map_err(|e| SidecarError::Hypervisor(format!("failed to spawn {binary}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SidecarError::Hypervisor(format!(
            "{binary} {} failed with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_names_skips_blank_lines() {
        let sessions = parse_session_names("instance-0001\n\n instance-0002 \n\n");
        assert_eq!(
            sessions,
            vec![
                GuestSession {
                    name: "instance-0001".to_string()
                },
                GuestSession {
                    name: "instance-0002".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_session_names_empty_output() {
        assert!(parse_session_names("\n").is_empty());
        assert!(parse_session_names("").is_empty());
    }

    #[tokio::test]
    async fn test_virsh_failure_includes_stderr() {
        let result = virsh("/bin/sh", "ignored", &["-c", "echo broken >&2; exit 2"]).await;
        // /bin/sh treats --connect/uri as leading arguments; what matters is
        // the error shape on non-zero exit.
        match result {
            Err(SidecarError::Hypervisor(message)) => {
                assert!(message.contains("exit status: 2") || message.contains("2"));
            }
            other => panic!("expected hypervisor error, got {other:?}"),
        }
    }
}
