//! Reload hooks.
//!
//! A reload hook is the purpose-specific action run after each successful
//! rotation, once new material is on disk. Hook failures are transient by
//! design: the pipeline logs them and keeps watching, so a temporarily
//! unreachable consumer never breaks rotation itself.

mod console;
mod daemon;

pub use console::ConsoleReloadHook;
pub use daemon::DaemonReloadHook;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ReloadHook: Send + Sync {
    /// Short identifier for logging.
    fn name(&self) -> &'static str;

    async fn reload(&self) -> Result<()>;
}
