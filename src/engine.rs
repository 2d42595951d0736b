//! Certificate lifecycle engine.
//!
//! The [`LifecycleEngine`] trait is the seam between a pipeline and the
//! machinery that actually issues and rotates material. The in-tree
//! implementation, [`CertManagerEngine`], defers issuance entirely to
//! cert-manager: it applies the rendered `Certificate` resource, waits for
//! the issued secret, and mirrors the material to every configured path
//! alias. Rotation is detected by watching the secret and comparing its data
//! against the last applied snapshot, so the initial list echo after
//! bootstrap does not fire a spurious rotation.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::await_condition;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::WritePathSet;
use crate::error::{Result, SidecarError};
use crate::template::Certificate;

/// Secret data keys written by cert-manager.
pub const SECRET_KEY_CA: &str = "ca.crt";
pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_KEY: &str = "tls.key";

const FIELD_MANAGER: &str = "virt-tls-sidecar";

const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

type SecretData = BTreeMap<String, ByteString>;

/// One observed replacement of on-disk certificate material.
#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub secret: String,
    pub resource_version: Option<String>,
    pub observed_at: DateTime<Utc>,
}

pub type RotationStream = BoxStream<'static, Result<RotationEvent>>;

/// Interface to the certificate acquisition and rotation machinery.
#[async_trait]
pub trait LifecycleEngine: Send + Sync {
    /// Establish the initial certificate material: submit the request and
    /// block until every path alias holds issued material. Errors are fatal
    /// for the owning pipeline.
    async fn create_initial(&self, certificate: &Certificate, paths: &WritePathSet) -> Result<()>;

    /// Watch for rotations. Each yielded event means the engine has already
    /// rewritten all path aliases with new material. The stream does not end
    /// under normal operation.
    async fn watch_rotations(
        &self,
        certificate: &Certificate,
        paths: &WritePathSet,
    ) -> Result<RotationStream>;
}

/// cert-manager backed lifecycle engine, one instance per pipeline.
pub struct CertManagerEngine {
    client: Client,
    last_applied: Arc<Mutex<Option<SecretData>>>,
}

impl CertManagerEngine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            last_applied: Arc::new(Mutex::new(None)),
        }
    }

    fn namespace_of(certificate: &Certificate) -> Result<String> {
        certificate.metadata.namespace.clone().ok_or_else(|| {
            SidecarError::Engine("rendered certificate has no namespace".to_string())
        })
    }
}

#[async_trait]
impl LifecycleEngine for CertManagerEngine {
    async fn create_initial(&self, certificate: &Certificate, paths: &WritePathSet) -> Result<()> {
        let namespace = Self::namespace_of(certificate)?;
        let name = certificate.name_any();

        let certificates: Api<Certificate> = Api::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        certificates
            .patch(&name, &params, &Patch::Apply(certificate))
            .await?;
        info!(certificate = %name, namespace = %namespace, "applied certificate request");

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let issued = await_condition(secrets.clone(), &name, secret_is_complete)
            .await
            .map_err(|e| SidecarError::Engine(format!("waiting for secret {name}: {e}")))?
            .ok_or_else(|| {
                SidecarError::Engine(format!("secret {name} disappeared while awaiting issuance"))
            })?;

        let data = secret_data(&issued)?;
        write_material(paths, &data).await?;
        *self.last_applied.lock().unwrap() = Some(data);
        info!(secret = %name, "initial certificate material written to all path aliases");

        Ok(())
    }

    async fn watch_rotations(
        &self,
        certificate: &Certificate,
        paths: &WritePathSet,
    ) -> Result<RotationStream> {
        let namespace = Self::namespace_of(certificate)?;
        let name = certificate.name_any();

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let watch_config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let last_applied = Arc::clone(&self.last_applied);
        let paths = paths.clone();
        let (mut tx, rx) = mpsc::channel::<Result<RotationEvent>>(4);

        tokio::spawn(async move {
            let mut events = watcher(secrets, watch_config).applied_objects().boxed();
            while let Some(item) = events.next().await {
                let forwarded = match item {
                    Ok(secret) => {
                        match apply_rotation(&secret, &paths, &last_applied).await {
                            Ok(Some(event)) => tx.send(Ok(event)).await,
                            Ok(None) => {
                                debug!(secret = %name, "secret event carried no new material");
                                Ok(())
                            }
                            Err(e) => tx.send(Err(e)).await,
                        }
                    }
                    Err(e) => tx.send(Err(SidecarError::Watch(e))).await,
                };
                if forwarded.is_err() {
                    // Receiver dropped: the pipeline is gone.
                    break;
                }
            }
        });

        Ok(rx.boxed())
    }
}

/// Condition for [`await_condition`]: the secret exists and carries complete
/// material.
fn secret_is_complete(secret: Option<&Secret>) -> bool {
    secret
        .and_then(|s| s.data.as_ref())
        .map(|data| {
            [SECRET_KEY_CA, SECRET_KEY_CERT, SECRET_KEY_KEY]
                .iter()
                .all(|key| data.contains_key(*key))
        })
        .unwrap_or(false)
}

fn secret_data(secret: &Secret) -> Result<SecretData> {
    let name = secret.name_any();
    let data = secret.data.clone().ok_or_else(|| SidecarError::IncompleteSecret {
        secret: name.clone(),
        key: SECRET_KEY_CERT.to_string(),
    })?;

    for key in [SECRET_KEY_CA, SECRET_KEY_CERT, SECRET_KEY_KEY] {
        if !data.contains_key(key) {
            return Err(SidecarError::IncompleteSecret {
                secret: name,
                key: key.to_string(),
            });
        }
    }
    Ok(data)
}

/// Mirror one secret event to disk if it carries new, complete material.
async fn apply_rotation(
    secret: &Secret,
    paths: &WritePathSet,
    last_applied: &Mutex<Option<SecretData>>,
) -> Result<Option<RotationEvent>> {
    let data = match secret_data(secret) {
        Ok(data) => data,
        Err(e) => {
            // Incomplete material is not a rotation; cert-manager will fill
            // the secret in a follow-up event.
            warn!(error = %e, "ignoring secret event with incomplete material");
            return Ok(None);
        }
    };

    {
        let last = last_applied.lock().unwrap();
        if last.as_ref() == Some(&data) {
            return Ok(None);
        }
    }

    write_material(paths, &data).await?;
    *last_applied.lock().unwrap() = Some(data);

    Ok(Some(RotationEvent {
        secret: secret.name_any(),
        resource_version: secret.metadata.resource_version.clone(),
        observed_at: Utc::now(),
    }))
}

/// Write CA, certificate, and key material to every configured alias.
///
/// Each file is written atomically (hidden temp file, then rename) with key
/// material restricted to the owner. Parent directories are created as
/// needed.
pub async fn write_material(paths: &WritePathSet, data: &SecretData) -> Result<()> {
    let ca = material(data, SECRET_KEY_CA)?;
    let cert = material(data, SECRET_KEY_CERT)?;
    let key = material(data, SECRET_KEY_KEY)?;

    for path in &paths.ca_paths {
        write_one(path, ca, CERT_MODE).await?;
    }
    for path in &paths.cert_paths {
        write_one(path, cert, CERT_MODE).await?;
    }
    for path in &paths.key_paths {
        write_one(path, key, KEY_MODE).await?;
    }
    Ok(())
}

fn material<'a>(data: &'a SecretData, key: &str) -> Result<&'a [u8]> {
    data.get(key)
        .map(|bytes| bytes.0.as_slice())
        .ok_or_else(|| SidecarError::IncompleteSecret {
            secret: "<material>".to_string(),
            key: key.to_string(),
        })
}

async fn write_one(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path.file_name().ok_or_else(|| {
        SidecarError::Engine(format!("write path {} has no file name", path.display()))
    })?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    // The temp file must never be more permissive than its final mode, so
    // it is created restricted rather than chmodded after the fact. A stale
    // temp file from an interrupted write may carry old permissions, so
    // they are reasserted before the rename.
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)
        .await?;
    file.write_all(contents).await?;
    file.flush().await?;
    drop(file);

    fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
