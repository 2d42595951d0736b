//! Hypervisor-broadcast reload hook for the console-display certificate.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::hypervisor::Hypervisor;
use crate::reload::ReloadHook;

/// Instructs every active guest session to reload its console TLS material.
///
/// Best-effort semantics: every session is attempted even when earlier ones
/// fail, each outcome is logged individually, and the invocation counts as
/// complete once all sessions were attempted. There is no retry of failed
/// guests within one invocation; the next rotation is the only retry
/// opportunity. The connection is scoped to the invocation and dropped on
/// every exit path.
pub struct ConsoleReloadHook<H: Hypervisor> {
    hypervisor: H,
}

impl<H: Hypervisor> ConsoleReloadHook<H> {
    pub fn new(hypervisor: H) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl<H: Hypervisor> ReloadHook for ConsoleReloadHook<H> {
    fn name(&self) -> &'static str {
        "console-broadcast"
    }

    async fn reload(&self) -> Result<()> {
        let connection = self.hypervisor.connect().await?;
        let sessions = connection.list_active_sessions().await?;

        if sessions.is_empty() {
            info!("no active guest sessions, nothing to reload");
            return Ok(());
        }

        let mut failed = 0usize;
        for session in &sessions {
            match connection.display_reload(session).await {
                Ok(response) => {
                    info!(guest = %session.name, response = %response.trim(), "reloaded console TLS material");
                }
                Err(e) => {
                    failed += 1;
                    error!(guest = %session.name, error = %e, "failed to reload console TLS material");
                }
            }
        }

        if failed > 0 {
            warn!(
                failed,
                attempted = sessions.len(),
                "console reload finished with failures"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SidecarError;
    use crate::hypervisor::{GuestSession, HypervisorConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        releases: AtomicUsize,
        attempts: AtomicUsize,
    }

    struct MockHypervisor {
        counters: Arc<Counters>,
        sessions: Vec<&'static str>,
        failing_session: Option<&'static str>,
        connect_fails: bool,
        enumerate_fails: bool,
    }

    struct MockConnection {
        counters: Arc<Counters>,
        sessions: Vec<&'static str>,
        failing_session: Option<&'static str>,
        enumerate_fails: bool,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Hypervisor for MockHypervisor {
        async fn connect(&self) -> Result<Box<dyn HypervisorConnection>> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_fails {
                return Err(SidecarError::Hypervisor("endpoint unreachable".to_string()));
            }
            Ok(Box::new(MockConnection {
                counters: Arc::clone(&self.counters),
                sessions: self.sessions.clone(),
                failing_session: self.failing_session,
                enumerate_fails: self.enumerate_fails,
            }))
        }
    }

    #[async_trait]
    impl HypervisorConnection for MockConnection {
        async fn list_active_sessions(&self) -> Result<Vec<GuestSession>> {
            if self.enumerate_fails {
                return Err(SidecarError::Hypervisor("list failed".to_string()));
            }
            Ok(self
                .sessions
                .iter()
                .map(|name| GuestSession {
                    name: name.to_string(),
                })
                .collect())
        }

        async fn display_reload(&self, session: &GuestSession) -> Result<String> {
            self.counters.attempts.fetch_add(1, Ordering::SeqCst);
            if Some(session.name.as_str()) == self.failing_session {
                return Err(SidecarError::Hypervisor("monitor command failed".to_string()));
            }
            Ok("{\"return\": {}}".to_string())
        }
    }

    fn hypervisor(counters: &Arc<Counters>) -> MockHypervisor {
        MockHypervisor {
            counters: Arc::clone(counters),
            sessions: vec!["guest-a", "guest-b", "guest-c"],
            failing_session: None,
            connect_fails: false,
            enumerate_fails: false,
        }
    }

    #[tokio::test]
    async fn test_all_sessions_attempted_despite_mid_list_failure() {
        let counters = Arc::new(Counters::default());
        let mut mock = hypervisor(&counters);
        mock.failing_session = Some("guest-b");

        let hook = ConsoleReloadHook::new(mock);
        let result = hook.reload().await;

        // Best-effort-complete: the invocation as a whole succeeds.
        assert!(result.is_ok());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_invocation_only() {
        let counters = Arc::new(Counters::default());
        let mut mock = hypervisor(&counters);
        mock.connect_fails = true;

        let hook = ConsoleReloadHook::new(mock);
        assert!(hook.reload().await.is_err());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_enumeration_failure_releases_connection() {
        let counters = Arc::new(Counters::default());
        let mut mock = hypervisor(&counters);
        mock.enumerate_fails = true;

        let hook = ConsoleReloadHook::new(mock);
        assert!(hook.reload().await.is_err());
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_sessions_is_success() {
        let counters = Arc::new(Counters::default());
        let mut mock = hypervisor(&counters);
        mock.sessions = Vec::new();

        let hook = ConsoleReloadHook::new(mock);
        assert!(hook.reload().await.is_ok());
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }
}
