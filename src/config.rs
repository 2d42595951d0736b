//! Sidecar configuration.
//!
//! Typed sections with reference-deployment defaults, loaded from an optional
//! TOML file layered with `SIDECAR__…` environment overrides. Host identity
//! fields additionally fall back to the conventional downward-API environment
//! (`POD_NAME`, `POD_NAMESPACE`, `POD_IP`, `HOSTNAME`).
//!
//! All validation happens before any pipeline starts; an invalid configuration
//! is fatal.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::template::{HostIdentity, IssuerRef};

/// Environment prefix for configuration overrides, e.g.
/// `SIDECAR__API__ISSUER__KIND`.
const ENV_PREFIX: &str = "SIDECAR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: HostIdentity,
    pub api: TransportConfig,
    pub vnc: ConsoleConfig,
    pub hypervisor: HypervisorConfig,
}

/// Transport-layer (libvirtd/QEMU) certificate purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub issuer: IssuerRef,
    pub paths: WritePathSet,
    /// Command asking the resident daemon to reread its certificate files.
    pub reload_command: Vec<String>,
}

/// Console-display (VNC) certificate purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub issuer: IssuerRef,
    pub paths: WritePathSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Hypervisor management endpoint.
    pub uri: String,
    /// Binary used to reach the endpoint.
    pub virsh_binary: String,
}

/// Filesystem locations that all receive a copy of the same material.
///
/// Three parallel alias lists, fixed at pipeline construction. Different
/// downstream consumers expect different conventional paths, so the engine
/// mirrors every rotation to every alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePathSet {
    pub ca_paths: Vec<PathBuf>,
    pub cert_paths: Vec<PathBuf>,
    pub key_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: HostIdentity::default(),
            api: TransportConfig::default(),
            vnc: ConsoleConfig::default(),
            hypervisor: HypervisorConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            issuer: IssuerRef::default(),
            paths: WritePathSet {
                ca_paths: vec![
                    PathBuf::from("/etc/pki/CA/cacert.pem"),
                    PathBuf::from("/etc/pki/qemu/ca-cert.pem"),
                ],
                cert_paths: vec![
                    PathBuf::from("/etc/pki/libvirt/servercert.pem"),
                    PathBuf::from("/etc/pki/libvirt/clientcert.pem"),
                    PathBuf::from("/etc/pki/qemu/server-cert.pem"),
                    PathBuf::from("/etc/pki/qemu/client-cert.pem"),
                ],
                key_paths: vec![
                    PathBuf::from("/etc/pki/libvirt/private/serverkey.pem"),
                    PathBuf::from("/etc/pki/libvirt/private/clientkey.pem"),
                    PathBuf::from("/etc/pki/qemu/server-key.pem"),
                    PathBuf::from("/etc/pki/qemu/client-key.pem"),
                ],
            },
            reload_command: vec![
                "virt-admin".to_string(),
                "server-update-tls".to_string(),
                "libvirtd".to_string(),
            ],
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            issuer: IssuerRef::default(),
            paths: WritePathSet {
                ca_paths: vec![PathBuf::from("/etc/pki/libvirt-vnc/ca-cert.pem")],
                cert_paths: vec![PathBuf::from("/etc/pki/libvirt-vnc/server-cert.pem")],
                key_paths: vec![PathBuf::from("/etc/pki/libvirt-vnc/server-key.pem")],
            },
        }
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            virsh_binary: "virsh".to_string(),
        }
    }
}

impl WritePathSet {
    fn validate(&self, section: &str) -> crate::Result<()> {
        if self.ca_paths.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(format!(
                "{section}.paths.ca_paths cannot be empty"
            )));
        }
        if self.cert_paths.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(format!(
                "{section}.paths.cert_paths cannot be empty"
            )));
        }
        if self.key_paths.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(format!(
                "{section}.paths.key_paths cannot be empty"
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered with
    /// environment overrides, then resolve identity fallbacks.
    pub fn load(path: Option<&str>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let raw = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| crate::error::SidecarError::Config(e.to_string()))?;

        let mut config: Config = raw
            .try_deserialize()
            .map_err(|e| crate::error::SidecarError::Config(e.to_string()))?;
        config.resolve_identity_from_env();
        Ok(config)
    }

    /// Fill unset identity fields from the downward-API environment.
    pub fn resolve_identity_from_env(&mut self) {
        fn fallback(field: &mut String, var: &str) {
            if field.is_empty() {
                if let Ok(value) = std::env::var(var) {
                    *field = value;
                }
            }
        }

        fallback(&mut self.identity.pod_name, "POD_NAME");
        fallback(&mut self.identity.namespace, "POD_NAMESPACE");
        fallback(&mut self.identity.ip, "POD_IP");
        fallback(&mut self.identity.hostname, "HOSTNAME");
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.identity.pod_name.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "identity.pod_name cannot be empty".to_string(),
            ));
        }
        if self.identity.namespace.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "identity.namespace cannot be empty".to_string(),
            ));
        }
        if self.identity.ip.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "identity.ip cannot be empty".to_string(),
            ));
        }
        if self.identity.hostname.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "identity.hostname cannot be empty".to_string(),
            ));
        }
        if self.identity.fqdn.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "identity.fqdn cannot be empty".to_string(),
            ));
        }

        for (section, issuer) in [("api", &self.api.issuer), ("vnc", &self.vnc.issuer)] {
            if issuer.kind.is_empty() {
                return Err(crate::error::SidecarError::InvalidConfig(format!(
                    "{section}.issuer.kind cannot be empty"
                )));
            }
            if issuer.name.is_empty() {
                return Err(crate::error::SidecarError::InvalidConfig(format!(
                    "{section}.issuer.name cannot be empty"
                )));
            }
        }

        self.api.paths.validate("api")?;
        self.vnc.paths.validate("vnc")?;

        if self.api.reload_command.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "api.reload_command cannot be empty".to_string(),
            ));
        }
        if self.hypervisor.uri.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "hypervisor.uri cannot be empty".to_string(),
            ));
        }
        if self.hypervisor.virsh_binary.is_empty() {
            return Err(crate::error::SidecarError::InvalidConfig(
                "hypervisor.virsh_binary cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
