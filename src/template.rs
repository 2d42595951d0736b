//! Certificate request rendering.
//!
//! Renders a cert-manager `Certificate` resource from a certificate purpose,
//! an issuer reference, and the host identity. The rendering is pure and
//! deterministic: identical inputs always produce an identical resource, so
//! re-rendering on identity refresh is idempotent.
//!
//! The naming rule is load-bearing: the resource name and the secret name are
//! both `<pod_name>-<purpose>`, and downstream secret lookups depend on that
//! exact concatenation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SidecarError};

/// Reference to the certificate authority a request is issued against.
///
/// Matches the `issuerRef` stanza of a cert-manager `Certificate`. Both
/// fields are mandatory and non-empty; [`render`] rejects anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IssuerRef {
    pub kind: String,
    pub name: String,
}

/// Identity of the host this sidecar issues certificates for.
///
/// Supplied once per process start by the configuration layer (downward API
/// environment or config file) and treated as immutable per render call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIdentity {
    pub pod_name: String,
    pub namespace: String,
    pub ip: String,
    pub hostname: String,
    pub fqdn: String,
}

/// Key usages requested for every certificate, independent of purpose.
///
/// cert-manager spells these with a space (`client auth`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum KeyUsage {
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "server auth")]
    ServerAuth,
}

/// cert-manager.io/v1 `Certificate` custom resource.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub usages: Vec<KeyUsage>,
    pub issuer_ref: IssuerRef,
    pub secret_name: String,
}

/// Render the certificate request for one purpose.
///
/// * resource name and secret name are `<pod_name>-<purpose>` and always equal
/// * DNS subject alt names are exactly `[hostname, fqdn]`, in that order
/// * IP subject alt names are exactly `[ip]`
/// * usages are always `client auth` and `server auth`
///
/// Fails with a configuration error when the purpose, issuer kind, or issuer
/// name is empty. No other field is validated here.
pub fn render(purpose: &str, issuer: &IssuerRef, identity: &HostIdentity) -> Result<Certificate> {
    if purpose.is_empty() {
        return Err(SidecarError::Config(
            "certificate purpose cannot be empty".to_string(),
        ));
    }
    if issuer.kind.is_empty() {
        return Err(SidecarError::Config(
            "issuer kind cannot be empty".to_string(),
        ));
    }
    if issuer.name.is_empty() {
        return Err(SidecarError::Config(
            "issuer name cannot be empty".to_string(),
        ));
    }

    let name = format!("{}-{}", identity.pod_name, purpose);
    let mut certificate = Certificate::new(
        &name,
        CertificateSpec {
            common_name: identity.fqdn.clone(),
            dns_names: vec![identity.hostname.clone(), identity.fqdn.clone()],
            ip_addresses: vec![identity.ip.clone()],
            usages: vec![KeyUsage::ClientAuth, KeyUsage::ServerAuth],
            issuer_ref: issuer.clone(),
            secret_name: name.clone(),
        },
    );
    certificate.metadata.namespace = Some(identity.namespace.clone());

    Ok(certificate)
}
