//! Certificate lifecycle pipeline.
//!
//! Binds one rendered certificate request, one set of write path aliases,
//! and one reload hook into a single managed lifecycle. The pipeline
//! bootstraps initial material (fatal on failure), then consumes rotation
//! events one at a time, invoking the hook after each. Hook failures are
//! logged and swallowed: rotation must keep working even while the
//! downstream reload action is failing.

use futures::StreamExt;
use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::config::WritePathSet;
use crate::engine::LifecycleEngine;
use crate::error::{Result, SidecarError};
use crate::reload::ReloadHook;
use crate::template::Certificate;

pub struct Pipeline<E: LifecycleEngine> {
    purpose: String,
    certificate: Certificate,
    paths: WritePathSet,
    hook: Box<dyn ReloadHook>,
    engine: E,
}

impl<E: LifecycleEngine> Pipeline<E> {
    pub fn new(
        purpose: impl Into<String>,
        certificate: Certificate,
        paths: WritePathSet,
        hook: Box<dyn ReloadHook>,
        engine: E,
    ) -> Self {
        Self {
            purpose: purpose.into(),
            certificate,
            paths,
            hook,
            engine,
        }
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Run the pipeline until the process shuts down.
    ///
    /// Returns only on a fatal bootstrap failure or when the rotation stream
    /// ends, which means the engine failed unrecoverably. There is no
    /// automatic restart; recovery is a process-restart concern.
    pub async fn run(self) -> Result<()> {
        info!(
            purpose = %self.purpose,
            certificate = %self.certificate.name_any(),
            "bootstrapping certificate material"
        );
        self.engine
            .create_initial(&self.certificate, &self.paths)
            .await
            .map_err(|e| SidecarError::Bootstrap {
                purpose: self.purpose.clone(),
                reason: e.to_string(),
            })?;
        info!(purpose = %self.purpose, "initial material in place, watching for rotation");

        let mut rotations = self
            .engine
            .watch_rotations(&self.certificate, &self.paths)
            .await?;

        while let Some(event) = rotations.next().await {
            match event {
                Ok(rotation) => {
                    info!(
                        purpose = %self.purpose,
                        secret = %rotation.secret,
                        resource_version = ?rotation.resource_version,
                        "certificate material rotated"
                    );
                    if let Err(e) = self.hook.reload().await {
                        error!(
                            purpose = %self.purpose,
                            hook = self.hook.name(),
                            error = %e,
                            "reload hook failed; on-disk material is current, consumer reload deferred to next rotation"
                        );
                    }
                }
                Err(e) => {
                    warn!(purpose = %self.purpose, error = %e, "rotation watch reported an error");
                }
            }
        }

        Err(SidecarError::Engine(format!(
            "rotation stream for purpose {} ended",
            self.purpose
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RotationEvent, RotationStream};
    use crate::template::{render, HostIdentity, IssuerRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn rendered_certificate() -> Certificate {
        render(
            "api",
            &IssuerRef {
                kind: "ClusterIssuer".to_string(),
                name: "ca-issuer".to_string(),
            },
            &HostIdentity {
                pod_name: "libvirt-node-1".to_string(),
                namespace: "default".to_string(),
                ip: "10.0.0.5".to_string(),
                hostname: "node1".to_string(),
                fqdn: "node1.cluster.local".to_string(),
            },
        )
        .unwrap()
    }

    fn rotation(secret: &str) -> RotationEvent {
        RotationEvent {
            secret: secret.to_string(),
            resource_version: None,
            observed_at: Utc::now(),
        }
    }

    struct MockEngine {
        bootstrap_fails: bool,
        bootstraps: Arc<AtomicUsize>,
        events: Mutex<Option<Vec<Result<RotationEvent>>>>,
    }

    impl MockEngine {
        fn with_events(events: Vec<Result<RotationEvent>>) -> Self {
            Self {
                bootstrap_fails: false,
                bootstraps: Arc::new(AtomicUsize::new(0)),
                events: Mutex::new(Some(events)),
            }
        }
    }

    #[async_trait]
    impl LifecycleEngine for MockEngine {
        async fn create_initial(
            &self,
            _certificate: &Certificate,
            _paths: &WritePathSet,
        ) -> Result<()> {
            self.bootstraps.fetch_add(1, Ordering::SeqCst);
            if self.bootstrap_fails {
                return Err(SidecarError::Engine("issuance refused".to_string()));
            }
            Ok(())
        }

        async fn watch_rotations(
            &self,
            _certificate: &Certificate,
            _paths: &WritePathSet,
        ) -> Result<RotationStream> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            Ok(stream::iter(events).boxed())
        }
    }

    struct FlakyHook {
        calls: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl ReloadHook for FlakyHook {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reload(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(SidecarError::Hypervisor("daemon unreachable".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_rotation_processing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = MockEngine::with_events(vec![
            Ok(rotation("libvirt-node-1-api")),
            Ok(rotation("libvirt-node-1-api")),
        ]);
        let pipeline = Pipeline::new(
            "api",
            rendered_certificate(),
            WritePathSet::default(),
            Box::new(FlakyHook {
                calls: Arc::clone(&calls),
                fail_first: true,
            }),
            engine,
        );

        // The mock stream ends after both events, which the pipeline treats
        // as engine failure.
        let result = pipeline.run().await;
        assert!(matches!(result, Err(SidecarError::Engine(_))));

        // Both rotations were observed: the first hook failure was swallowed.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watch_errors_are_absorbed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = MockEngine::with_events(vec![
            Err(SidecarError::Engine("transient watch error".to_string())),
            Ok(rotation("libvirt-node-1-api")),
        ]);
        let pipeline = Pipeline::new(
            "api",
            rendered_certificate(),
            WritePathSet::default(),
            Box::new(FlakyHook {
                calls: Arc::clone(&calls),
                fail_first: false,
            }),
            engine,
        );

        let _ = pipeline.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal_and_hook_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = MockEngine::with_events(vec![Ok(rotation("libvirt-node-1-api"))]);
        engine.bootstrap_fails = true;
        let bootstraps = Arc::clone(&engine.bootstraps);

        let pipeline = Pipeline::new(
            "api",
            rendered_certificate(),
            WritePathSet::default(),
            Box::new(FlakyHook {
                calls: Arc::clone(&calls),
                fail_first: false,
            }),
            engine,
        );

        let result = pipeline.run().await;
        match result {
            Err(SidecarError::Bootstrap { purpose, .. }) => assert_eq!(purpose, "api"),
            other => panic!("expected bootstrap error, got {other:?}"),
        }
        assert_eq!(bootstraps.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
