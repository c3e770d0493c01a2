//! Session (§3/§4.D): one dump-analysis session, binding one
//! [`ProcessDriver`] to one [`CommandQueue`] plus its metadata.
//!
//! Grounded on the teacher's `ShellSession`: disposal drops the driver's
//! handles before awaiting process exit so a wedged debugger can't hang the
//! close path indefinitely (the `disposal_timeout` escalation in
//! `driver::stop` is what actually guarantees forward progress).

use crate::driver::{CommandExecutor, DriverConfig, ProcessDriver};
use crate::error::CoreError;
use crate::notify::{NotificationBus, SessionEvent, SessionEventKind};
use crate::queue::{CommandQueue, CommandRecord};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Lifecycle states for a session (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Active,
    Disposing,
    Disposed,
}

/// Everything about a session that doesn't belong to the driver or queue.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_id: String,
    pub dump_path: String,
    pub symbols_path: Option<String>,
    pub created_at: Instant,
}

/// One open dump-analysis session: a driver, a command queue against it, and
/// the bookkeeping the session manager needs to expire it.
pub struct Session {
    pub metadata: SessionMetadata,
    driver: Arc<ProcessDriver>,
    queue: Arc<CommandQueue>,
    status: std::sync::Mutex<SessionStatus>,
    last_activity_secs: AtomicU64,
    started_at: Instant,
    disposed: AtomicBool,
    notify: Arc<NotificationBus>,
    /// Child of the process-wide shutdown token (§5 cancel composition
    /// source (d)); cancelled on `dispose` (source (c)) and by that token
    /// cancelling first, whichever comes first. Every per-command token
    /// (`queue::CommandQueue`) is in turn a child of this one.
    session_cancel: CancellationToken,
}

impl Session {
    /// Start the debugger and build the session around it. Returns once the
    /// driver is `Ready` (or the startup attempt has failed).
    ///
    /// `process_shutdown` is the process-wide cancellation token owned by
    /// [`crate::manager::SessionManager`]; this session's own disposal token
    /// is a child of it, and every command's cancel token is in turn a child
    /// of that (§5: "(c) session disposal, (d) process-wide shutdown").
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        session_id: String,
        dump_path: String,
        symbols_path: Option<String>,
        debugger_path: std::path::PathBuf,
        command_timeout: Duration,
        startup_timeout: Duration,
        disposal_timeout: Duration,
        startup_retries: i64,
        retain_duration: Duration,
        retain_max_entries: usize,
        notify: Arc<NotificationBus>,
        process_shutdown: CancellationToken,
    ) -> Result<Arc<Self>, CoreError> {
        validate_dump_and_symbols_paths(&dump_path, symbols_path.as_deref()).await?;

        let driver_config = DriverConfig {
            debugger_path,
            dump_path: dump_path.clone().into(),
            symbols_path: symbols_path.clone().map(Into::into),
            command_timeout,
            startup_timeout,
            disposal_timeout,
            startup_retries,
            session_id: session_id.clone(),
        };

        let driver = Arc::new(ProcessDriver::new(driver_config)?);
        driver.start().await?;

        let session_cancel = process_shutdown.child_token();

        let executor: Arc<dyn CommandExecutor> = Arc::clone(&driver) as Arc<dyn CommandExecutor>;
        let queue = CommandQueue::new(
            session_id.clone(),
            executor,
            command_timeout,
            retain_duration,
            retain_max_entries,
            Arc::clone(&notify),
            session_cancel.clone(),
        );

        let now = Instant::now();
        let session = Arc::new(Self {
            metadata: SessionMetadata {
                session_id: session_id.clone(),
                dump_path,
                symbols_path,
                created_at: now,
            },
            driver,
            queue,
            status: std::sync::Mutex::new(SessionStatus::Active),
            last_activity_secs: AtomicU64::new(0),
            started_at: now,
            disposed: AtomicBool::new(false),
            notify,
            session_cancel,
        });

        session
            .notify
            .publish_session(SessionEvent {
                session_id: session.metadata.session_id.clone(),
                kind: SessionEventKind::Created,
            })
            .await;

        Ok(session)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().expect("session status mutex poisoned")
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    /// Seconds since the session's creation that it was last touched by a
    /// submit/status/close call (§5 idle-timeout reference point).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_secs.load(Ordering::SeqCst);
        let elapsed_since_creation = self.started_at.elapsed().as_secs();
        Duration::from_secs(elapsed_since_creation.saturating_sub(last))
    }

    fn touch(&self) {
        self.last_activity_secs
            .store(self.started_at.elapsed().as_secs(), Ordering::SeqCst);
    }

    /// Submit a command to this session's queue. Rejects if the session is
    /// not `Active` (§4.D: `SessionClosing` while disposing).
    pub async fn submit_command(&self, command_text: impl Into<String>) -> Result<String, CoreError> {
        match self.status() {
            SessionStatus::Active => {}
            SessionStatus::Disposing | SessionStatus::Disposed => {
                return Err(CoreError::SessionClosing(self.metadata.session_id.clone()))
            }
            SessionStatus::Initializing => return Err(CoreError::NotActive),
        }
        self.touch();
        self.queue.enqueue(command_text).await
    }

    pub async fn command_status(&self, command_id: &str) -> Result<CommandRecord, CoreError> {
        self.touch();
        self.queue.get_status(command_id).await
    }

    pub async fn cancel_command(&self, command_id: &str) -> Result<(), CoreError> {
        self.touch();
        self.queue.cancel(command_id).await
    }

    pub async fn command_history(&self) -> Vec<CommandRecord> {
        self.queue.snapshot().await
    }

    /// Idempotently tear the session down: cancel any outstanding commands,
    /// then stop the driver (which itself escalates to a kill after
    /// `disposal_timeout`).
    pub async fn dispose(&self, kind: SessionEventKind) -> Result<(), CoreError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.status.lock().expect("session status mutex poisoned") = SessionStatus::Disposing;

        // Cancels every command token derived from this session, queued or
        // executing, present or still to be enqueued before the driver stop
        // below finishes racing with any in-flight `submit_command` caller.
        self.session_cancel.cancel();
        self.queue.cancel_all().await;
        let result = self.driver.stop().await;

        *self.status.lock().expect("session status mutex poisoned") = SessionStatus::Disposed;
        self.notify
            .publish_session(SessionEvent {
                session_id: self.metadata.session_id.clone(),
                kind,
            })
            .await;

        result
    }
}

/// §3: "dump_path ... validated at creation; dump must exist as a file;
/// symbols, if given, must exist as a directory."
async fn validate_dump_and_symbols_paths(dump_path: &str, symbols_path: Option<&str>) -> Result<(), CoreError> {
    let dump_meta = tokio::fs::metadata(dump_path)
        .await
        .map_err(|e| CoreError::InvalidArgument(format!("dump_path '{dump_path}' does not exist: {e}")))?;
    if !dump_meta.is_file() {
        return Err(CoreError::InvalidArgument(format!(
            "dump_path '{dump_path}' is not a file"
        )));
    }

    if let Some(symbols_path) = symbols_path {
        let symbols_meta = tokio::fs::metadata(symbols_path)
            .await
            .map_err(|e| CoreError::InvalidArgument(format!("symbols_path '{symbols_path}' does not exist: {e}")))?;
        if !symbols_meta.is_dir() {
            return Err(CoreError::InvalidArgument(format!(
                "symbols_path '{symbols_path}' is not a directory"
            )));
        }
    }

    Ok(())
}
