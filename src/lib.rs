pub mod config;
pub mod engine;
pub mod error;
pub mod hypervisor;
pub mod orchestrator;
pub mod panic_handler;
pub mod pipeline;
pub mod reload;
pub mod template;

pub use config::Config;
pub use error::{Result, SidecarError};
