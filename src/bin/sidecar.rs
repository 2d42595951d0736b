//! virt-tls-sidecar - certificate lifecycle sidecar for libvirt hosts.
//!
//! Renders one cert-manager certificate request per purpose (transport and
//! console display), keeps the issued material mirrored on disk, and reloads
//! the consumers after every rotation. Runs until externally terminated.

use std::env;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info};

use virt_tls_sidecar::orchestrator::Orchestrator;
use virt_tls_sidecar::{panic_handler, Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    panic_handler::install_panic_hook();

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str);
    match config_path {
        Some(path) => info!("Loading configuration from: {}", path),
        None => info!("No configuration file given, using defaults and environment"),
    }

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let client = kube::Client::try_default().await?;
    let orchestrator = Orchestrator::new(&config, client)?;

    info!("Starting certificate lifecycle orchestrator");

    tokio::select! {
        result = orchestrator.run() => {
            // Only reached on fatal pipeline failure; propagate for a
            // non-zero exit.
            if let Err(ref e) = result {
                error!("Certificate orchestrator stopped: {}", e);
            }
            result
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            // Fall back to Ctrl+C only.
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
