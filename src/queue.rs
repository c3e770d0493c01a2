//! Command Queue (§4.C): a per-session FIFO of commands against one driver.
//!
//! Exactly one executor task per queue drains the FIFO and calls
//! `CommandExecutor::execute` one command at a time -- the single-executor
//! discipline `driver::ProcessDriver` depends on. Callers get a handle back
//! immediately (`enqueue`) and poll or await completion (`get_status`,
//! `wait`); terminal results are retained for a bounded time/count window
//! (§3: `T_retain`, `N_max`) before being pruned.

use crate::driver::CommandExecutor;
use crate::error::CoreError;
use crate::notify::{CommandStatusEvent, NotificationBus, SessionEvent, SessionEventKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Terminal and non-terminal states a queued command passes through (§4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    Executing,
    Completed { output: String },
    Failed { message: String },
    Cancelled,
    TimedOut,
}

impl CommandState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed { .. }
                | CommandState::Failed { .. }
                | CommandState::Cancelled
                | CommandState::TimedOut
        )
    }
}

/// A command's full record, as returned by status lookups (§6 status tool).
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub command_id: String,
    pub session_id: String,
    pub command_text: String,
    pub state: CommandState,
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

struct QueuedEntry {
    record: CommandRecord,
    cancel: CancellationToken,
}

/// A FIFO of commands executed one at a time against a single
/// [`CommandExecutor`], with bounded retention of terminal results.
pub struct CommandQueue {
    session_id: String,
    executor: Arc<dyn CommandExecutor>,
    entries: Mutex<std::collections::HashMap<String, QueuedEntry>>,
    order: Mutex<VecDeque<String>>,
    work_tx: mpsc::UnboundedSender<String>,
    next_seq: AtomicU64,
    retain_duration: Duration,
    retain_max_entries: usize,
    /// Kept for parity with the caller's configuration; timeout enforcement
    /// itself lives in `driver::ProcessDriver::execute`'s own deadline, not
    /// here (see `run_one`).
    #[allow(dead_code)]
    command_timeout: Duration,
    notify: Arc<NotificationBus>,
    /// Parent of every command's own cancel token (§5 composition sources
    /// "(c) session disposal" and, transitively through it, "(d) process-wide
    /// shutdown"); cancelling this cancels every queued and executing command
    /// at once. Owned by the [`crate::session::Session`] above this queue.
    session_cancel: CancellationToken,
}

impl CommandQueue {
    /// Build a queue and spawn its single executor task.
    pub fn new(
        session_id: String,
        executor: Arc<dyn CommandExecutor>,
        command_timeout: Duration,
        retain_duration: Duration,
        retain_max_entries: usize,
        notify: Arc<NotificationBus>,
        session_cancel: CancellationToken,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel::<String>();
        let queue = Arc::new(Self {
            session_id,
            executor,
            entries: Mutex::new(std::collections::HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            work_tx,
            next_seq: AtomicU64::new(0),
            retain_duration,
            retain_max_entries,
            command_timeout,
            notify,
            session_cancel,
        });
        Self::spawn_executor(Arc::clone(&queue), work_rx);
        queue
    }

    fn spawn_executor(queue: Arc<Self>, mut work_rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(command_id) = work_rx.recv().await {
                queue.run_one(&command_id).await;
                queue.prune().await;
            }
        });
    }

    /// Enqueue a command. Returns the new command's id immediately; the
    /// command itself runs asynchronously on the queue's executor task.
    pub async fn enqueue(&self, command_text: impl Into<String>) -> Result<String, CoreError> {
        let command_text = command_text.into();
        if command_text.trim().is_empty() {
            return Err(CoreError::InvalidArgument("command must not be empty".into()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let command_id = format!("cmd-{}-{seq:04}", self.session_id);

        let record = CommandRecord {
            command_id: command_id.clone(),
            session_id: self.session_id.clone(),
            command_text,
            state: CommandState::Queued,
            queued_at: Instant::now(),
            started_at: None,
            finished_at: None,
        };

        let entry = QueuedEntry {
            record,
            cancel: self.session_cancel.child_token(),
        };

        self.entries.lock().await.insert(command_id.clone(), entry);
        self.order.lock().await.push_back(command_id.clone());

        self.notify
            .publish_command(CommandStatusEvent {
                session_id: self.session_id.clone(),
                command_id: command_id.clone(),
                state: "queued".into(),
            })
            .await;

        self.work_tx
            .send(command_id.clone())
            .map_err(|_| CoreError::Internal("queue executor task is gone".into()))?;

        Ok(command_id)
    }

    async fn run_one(&self, command_id: &str) {
        let (command_text, cancel) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(command_id) else {
                return;
            };
            entry.record.state = CommandState::Executing;
            entry.record.started_at = Some(Instant::now());
            (entry.record.command_text.clone(), entry.cancel.clone())
        };

        // A command cancelled while still queued never touches the driver at
        // all (§4.C: "aborts before writing if still Queued").
        if cancel.is_cancelled() {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(command_id) {
                entry.record.state = CommandState::Cancelled;
                entry.record.finished_at = Some(Instant::now());
            }
            drop(entries);
            self.notify
                .publish_command(CommandStatusEvent {
                    session_id: self.session_id.clone(),
                    command_id: command_id.to_string(),
                    state: "cancelled".into(),
                })
                .await;
            return;
        }

        self.notify
            .publish_command(CommandStatusEvent {
                session_id: self.session_id.clone(),
                command_id: command_id.to_string(),
                state: "executing".into(),
            })
            .await;

        // Per-command timeout (§5 composition source "(b)") is enforced by
        // the driver's own deadline around the write/read-until-prompt cycle,
        // not by racing a sibling sleeper against this token: folding it in
        // here would cancel `cancel` itself, collapsing `TimedOut` into
        // `CancelledByCaller` and losing the distinction §4.C requires.
        let result = self.executor.execute(&command_text, cancel.clone()).await;

        let process_died = matches!(result, Err(CoreError::ProcessDied(_)));
        let (final_state, event_label) = match result {
            Ok(output) => (CommandState::Completed { output }, "completed"),
            Err(CoreError::CommandTimeout(_)) => (CommandState::TimedOut, "timed_out"),
            Err(CoreError::CancelledByCaller) => (CommandState::Cancelled, "cancelled"),
            Err(e) => (CommandState::Failed { message: e.to_string() }, "failed"),
        };

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(command_id) {
            entry.record.state = final_state;
            entry.record.finished_at = Some(Instant::now());
        }
        drop(entries);

        self.notify
            .publish_command(CommandStatusEvent {
                session_id: self.session_id.clone(),
                command_id: command_id.to_string(),
                state: event_label.into(),
            })
            .await;

        // A dead process can't run anything queued behind the command that
        // killed it (§8 "process death" scenario): cancel the rest of the
        // queue and let the session manager hear about it so it can close
        // the session rather than leave it around returning errors forever.
        if process_died {
            self.cancel_all().await;
            self.notify
                .publish_session(SessionEvent {
                    session_id: self.session_id.clone(),
                    kind: SessionEventKind::ProcessDied,
                })
                .await;
        }
    }

    /// Fetch the current record for one command.
    pub async fn get_status(&self, command_id: &str) -> Result<CommandRecord, CoreError> {
        self.entries
            .lock()
            .await
            .get(command_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| CoreError::CommandNotFound(command_id.to_string()))
    }

    /// Request cancellation of a running (or still-queued) command.
    pub async fn cancel(&self, command_id: &str) -> Result<(), CoreError> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(command_id)
            .ok_or_else(|| CoreError::CommandNotFound(command_id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancel every non-terminal command, queued or executing, present or
    /// still to be enqueued -- used when a session is disposed (§5
    /// composition source "(c)"). Cancelling the shared parent token reaches
    /// every command's child token in one call rather than walking the map.
    pub async fn cancel_all(&self) {
        self.session_cancel.cancel();
    }

    /// Snapshot of all known commands, most recently queued last.
    pub async fn snapshot(&self) -> Vec<CommandRecord> {
        let order = self.order.lock().await;
        let entries = self.entries.lock().await;
        order
            .iter()
            .filter_map(|id| entries.get(id).map(|e| e.record.clone()))
            .collect()
    }

    /// Await the eventual terminal state of a command, blocking the caller.
    /// Used by any synchronous-feeling "wait" entry point layered on top of
    /// the otherwise async queue; polls at a short interval since terminal
    /// transitions don't currently broadcast a completion channel per command.
    pub async fn wait_terminal(&self, command_id: &str, poll_interval: Duration) -> Result<CommandRecord, CoreError> {
        loop {
            let record = self.get_status(command_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Drop terminal entries older than `retain_duration`, keeping at most
    /// `retain_max_entries` terminal entries overall (oldest pruned first).
    async fn prune(&self) {
        let now = Instant::now();
        let mut order = self.order.lock().await;
        let mut entries = self.entries.lock().await;

        let terminal_count = order
            .iter()
            .filter(|id| entries.get(*id).is_some_and(|e| e.record.state.is_terminal()))
            .count();
        let mut excess = terminal_count.saturating_sub(self.retain_max_entries);

        let mut retained = VecDeque::with_capacity(order.len());
        while let Some(id) = order.pop_front() {
            let Some(entry) = entries.get(&id) else { continue };
            let should_drop = entry.record.state.is_terminal()
                && (excess > 0
                    || entry
                        .record
                        .finished_at
                        .is_some_and(|t| now.duration_since(t) > self.retain_duration));
            if should_drop {
                if excess > 0 {
                    excess -= 1;
                }
                entries.remove(&id);
            } else {
                retained.push_back(id);
            }
        }
        *order = retained;
    }
}

/// oneshot-based handle kept for future use by callers that want a
/// notification the instant a command finishes rather than polling; not
/// wired into any tool today since the status tool is poll-based.
#[allow(dead_code)]
pub struct CompletionWaiter {
    pub rx: oneshot::Receiver<CommandState>,
}
