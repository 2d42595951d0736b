//! Production panic hook: log panic location and message through tracing
//! before the default hook runs.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the panic hook. Call once early in main; repeated calls are
/// no-ops.
pub fn install_panic_hook() {
    if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        error!(location = %location, message = %message, "panic in certificate sidecar");
        previous(info);
    }));
}
