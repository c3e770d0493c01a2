//! Session Manager (§4.D, component E): create/close/list sessions, enforce
//! the concurrent-session cap, and sweep expired sessions in the background.
//!
//! Grounded on the teacher's `SessionManager` (capacity check inside the
//! lock before insert) generalized with a standing cleanup task, the way
//! `registry::prune_expired` is periodic there but one-shot-per-call; here
//! it runs as its own `tokio::spawn` loop for the lifetime of the process.

use crate::config::ServerConfig;
use crate::error::CoreError;
use crate::notify::{NotificationBus, NotificationEvent, SessionEventKind};
use crate::session::Session;
use dashmap::DashMap;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Owns every open [`Session`], keyed by session id.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    config: ServerConfig,
    notify: Arc<NotificationBus>,
    next_seq: AtomicU64,
    /// Root of the cancel-token hierarchy (§5 composition source "(d)
    /// process-wide shutdown"): every session's disposal token, and every
    /// command's cancel token beneath it, is a descendant of this one.
    shutdown: CancellationToken,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: ServerConfig, notify: Arc<NotificationBus>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            config,
            notify,
            next_seq: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        manager.spawn_process_died_watcher();
        manager
    }

    /// Cancel the process-wide shutdown token, cascading into every open
    /// session's disposal token and every in-flight command's cancel token
    /// (§4.C: "if shutdown: drain remaining as Cancelled(\"shutdown\")").
    /// Sessions themselves are not removed from the table here; the caller
    /// (`main.rs`) is expected to be shutting the whole process down right
    /// after.
    pub fn shutdown(&self) {
        tracing::info!("process shutdown requested, cancelling outstanding work");
        self.shutdown.cancel();
    }

    /// React to a session's own queue reporting `ProcessDied` (§8 "process
    /// death" scenario) by closing the session the same way an explicit
    /// close would, so later submissions against it see `SessionNotFound`
    /// rather than a session stuck returning internal errors forever.
    fn spawn_process_died_watcher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut rx = manager.notify.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(NotificationEvent::Session(event))
                        if event.kind == SessionEventKind::ProcessDied =>
                    {
                        tracing::warn!(session = %event.session_id, "debugger process died, closing session");
                        let _ = manager.close(&event.session_id).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "process-died watcher lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn new_session_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let suffix: u32 = rand::thread_rng().gen();
        format!("sess-{seq:06}-{suffix:08x}")
    }

    /// Open a new session against `dump_path`, spawning its debugger
    /// subprocess. Rejects with `CapacityExceeded` if the concurrent-session
    /// cap (§3 SessionTable, §5) is already met.
    pub async fn create(
        self: &Arc<Self>,
        dump_path: String,
        symbols_path: Option<String>,
        debugger_path: PathBuf,
    ) -> Result<Arc<Session>, CoreError> {
        if dump_path.trim().is_empty() {
            return Err(CoreError::InvalidArgument("dump_path must not be empty".into()));
        }

        if self.sessions.len() >= self.config.max_concurrent_sessions {
            return Err(CoreError::CapacityExceeded {
                running: self.sessions.len(),
                max: self.config.max_concurrent_sessions,
            });
        }

        let session_id = self.new_session_id();
        let session = Session::open(
            session_id.clone(),
            dump_path,
            symbols_path,
            debugger_path,
            self.config.command_timeout,
            self.config.startup_timeout,
            self.config.disposal_timeout,
            self.config.startup_retries,
            self.config.retain_duration,
            self.config.retain_max_entries,
            Arc::clone(&self.notify),
            self.shutdown.child_token(),
        )
        .await?;

        // Re-check under the map's own concurrency control: two concurrent
        // `create` calls could both pass the length check above before
        // either inserts.
        if self.sessions.len() >= self.config.max_concurrent_sessions {
            let _ = session.dispose(SessionEventKind::Disposed).await;
            return Err(CoreError::CapacityExceeded {
                running: self.sessions.len(),
                max: self.config.max_concurrent_sessions,
            });
        }

        self.sessions.insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, CoreError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Close a session by id: dispose its driver/queue, then remove it from
    /// the table.
    pub async fn close(&self, session_id: &str) -> Result<(), CoreError> {
        let session = self.get(session_id)?;
        let result = session.dispose(SessionEventKind::Closed).await;
        self.sessions.remove(session_id);
        result
    }

    /// Start the background sweep that disposes sessions idle longer than
    /// `session_idle_timeout`, at `cleanup_interval` cadence. Runs for the
    /// lifetime of the process; `main.rs` calls this once at startup.
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = manager.config.cleanup_interval;
        let idle_timeout = manager.config.session_idle_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.sweep_expired(idle_timeout).await;
            }
        });
    }

    async fn sweep_expired(&self, idle_timeout: std::time::Duration) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > idle_timeout)
            .map(|e| e.key().clone())
            .collect();

        for session_id in expired {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                tracing::info!(session = %session_id, "expiring idle session");
                let _ = session.dispose(SessionEventKind::Expired).await;
            }
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_follow_the_grammar() {
        let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
        let id = manager.new_session_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sess");
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn session_ids_are_unique_across_calls() {
        let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
        let a = manager.new_session_id();
        let b = manager.new_session_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn create_rejects_empty_dump_path() {
        let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
        let err = manager
            .create(String::new(), None, PathBuf::from("/usr/bin/true"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
        let err = manager.get("sess-999999-deadbeef").unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn close_unknown_session_is_not_found() {
        let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
        let err = manager.close("sess-999999-deadbeef").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }
}
