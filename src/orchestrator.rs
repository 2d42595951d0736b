//! Orchestrator: one independent lifecycle pipeline per certificate purpose.
//!
//! Pipelines share no mutable state and are supervised fail-fast: the first
//! pipeline that exits (always an error in practice) aborts the run and the
//! process terminates non-zero. Restart is an operational concern.

use kube::Client;
use tokio::task::JoinSet;
use tracing::info;

use crate::config::Config;
use crate::engine::CertManagerEngine;
use crate::error::{Result, SidecarError};
use crate::hypervisor::VirshHypervisor;
use crate::pipeline::Pipeline;
use crate::reload::{ConsoleReloadHook, DaemonReloadHook};
use crate::template;

/// Transport-layer certificate purpose (libvirtd/QEMU).
pub const PURPOSE_API: &str = "api";
/// Console-display certificate purpose (VNC).
pub const PURPOSE_VNC: &str = "vnc";

pub struct Orchestrator {
    pipelines: Vec<Pipeline<CertManagerEngine>>,
}

impl Orchestrator {
    /// Render both certificate requests and assemble their pipelines.
    ///
    /// Render failures (empty issuer fields) surface here, before anything
    /// is started.
    pub fn new(config: &Config, client: Client) -> Result<Self> {
        let api_certificate = template::render(PURPOSE_API, &config.api.issuer, &config.identity)?;
        let vnc_certificate = template::render(PURPOSE_VNC, &config.vnc.issuer, &config.identity)?;

        let api_pipeline = Pipeline::new(
            PURPOSE_API,
            api_certificate,
            config.api.paths.clone(),
            Box::new(DaemonReloadHook::new(config.api.reload_command.clone())),
            CertManagerEngine::new(client.clone()),
        );
        let vnc_pipeline = Pipeline::new(
            PURPOSE_VNC,
            vnc_certificate,
            config.vnc.paths.clone(),
            Box::new(ConsoleReloadHook::new(VirshHypervisor::new(
                &config.hypervisor,
            ))),
            CertManagerEngine::new(client),
        );

        Ok(Self {
            pipelines: vec![api_pipeline, vnc_pipeline],
        })
    }

    /// Run all pipelines concurrently and block for the life of the process.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for pipeline in self.pipelines {
            info!(purpose = %pipeline.purpose(), "starting certificate lifecycle pipeline");
            tasks.spawn(pipeline.run());
        }

        // Fail fast: the first pipeline to exit takes the process down.
        // Dropping the JoinSet aborts the remaining pipelines.
        if let Some(joined) = tasks.join_next().await {
            return match joined {
                Ok(Ok(())) => Err(SidecarError::Engine(
                    "certificate pipeline exited unexpectedly".to_string(),
                )),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(SidecarError::Engine(format!(
                    "certificate pipeline panicked: {e}"
                ))),
            };
        }
        Ok(())
    }
}
