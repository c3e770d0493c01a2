//! Debugger Process Driver (§4.A): owns one CDB/WinDbg subprocess.
//!
//! One [`ProcessDriver`] per session. Spawns the debugger, writes commands
//! to its stdin, and reads its stdout on an independent task that feeds a
//! bounded channel the executor drains -- the single-writer / single-reader
//! discipline spec §5 requires. Completion of a command is detected by a
//! sentinel-echo command appended after the user command (§4.A algorithm);
//! a bare prompt is never treated as sufficient on its own (see DESIGN.md
//! Open Question decisions).

use crate::detector;
use crate::error::CoreError;
use async_trait::async_trait;
use rand::Rng;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Bound on the internal line channel between the stdout reader task and the
/// executor that drains it (§5 "bounded internal channel").
const LINE_CHANNEL_CAPACITY: usize = 4096;

/// Construction inputs for a [`ProcessDriver`] (§4.A).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub debugger_path: PathBuf,
    pub dump_path: PathBuf,
    pub symbols_path: Option<PathBuf>,
    pub command_timeout: Duration,
    pub startup_timeout: Duration,
    pub disposal_timeout: Duration,
    /// Extra spawn+first-prompt attempts after the first fails (§4.A:
    /// "retries non-negative"). `0` means a single attempt, no retry.
    pub startup_retries: i64,
    /// Used only to tag sentinels and log lines.
    pub session_id: String,
}

impl DriverConfig {
    /// Validate numeric parameters: all timeouts must be positive, retries
    /// non-negative (§4.A).
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [
            ("command_timeout", self.command_timeout),
            ("startup_timeout", self.startup_timeout),
            ("disposal_timeout", self.disposal_timeout),
        ] {
            if value.is_zero() {
                return Err(CoreError::ConfigInvalid(format!(
                    "{name} must be positive, got {value:?}"
                )));
            }
        }
        if self.startup_retries < 0 {
            return Err(CoreError::ConfigInvalid(format!(
                "startup_retries must be non-negative, got {}",
                self.startup_retries
            )));
        }
        Ok(())
    }
}

/// Lifecycle states from §4.A: `Idle -> Starting -> Ready -> Executing <-> Ready -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Starting,
    Ready,
    Executing,
    Stopping,
    Stopped,
}

/// A debugger command executor, abstracted so tests can substitute a fake
/// process for the real CDB/WinDbg subprocess (see `queue` tests).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, cancel: CancellationToken) -> Result<String, CoreError>;
    async fn stop(&self) -> Result<(), CoreError>;
}

/// Owns one interactive debugger subprocess.
pub struct ProcessDriver {
    config: DriverConfig,
    state: Mutex<DriverState>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    lines_rx: Mutex<Option<mpsc::Receiver<String>>>,
    disposed: AtomicBool,
    tag_counter: AtomicU64,
}

impl ProcessDriver {
    /// Construct a driver. Validates `config` up front (§4.A: fails with
    /// `ConfigInvalid` on violation).
    pub fn new(config: DriverConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(DriverState::Idle),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            lines_rx: Mutex::new(None),
            disposed: AtomicBool::new(false),
            tag_counter: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub async fn state(&self) -> DriverState {
        *self.state.lock().await
    }

    fn ensure_not_disposed(&self) -> Result<(), CoreError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(CoreError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Spawn the subprocess and wait until the detector observes the first
    /// prompt, or `startup_timeout` elapses. Retries up to
    /// `config.startup_retries` additional times on failure (§4.A), since a
    /// debugger subprocess can fail to come up cleanly on a loaded host.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.ensure_not_disposed()?;
        {
            let mut state = self.state.lock().await;
            if *state != DriverState::Idle {
                return Err(CoreError::Internal("driver already started".into()));
            }
            *state = DriverState::Starting;
        }

        let attempts = self.config.startup_retries as u32 + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.spawn_and_wait_ready().await {
                Ok(()) => {
                    *self.state.lock().await = DriverState::Ready;
                    tracing::info!(session = %self.config.session_id, attempt, "debugger ready");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        session = %self.config.session_id,
                        attempt,
                        attempts,
                        error = %e,
                        "debugger startup attempt failed"
                    );
                    self.force_stopped().await;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("loop runs at least once since attempts >= 1"))
    }

    /// One spawn-and-wait-for-prompt attempt. Leaves `self.state` untouched;
    /// the caller (`start`) owns the `Starting -> Ready` / `-> Stopped`
    /// transition across the whole retry loop.
    async fn spawn_and_wait_ready(&self) -> Result<(), CoreError> {
        let mut cmd = Command::new(&self.config.debugger_path);
        cmd.arg("-z").arg(&self.config.dump_path);
        if let Some(symbols) = &self.config.symbols_path {
            cmd.arg("-y").arg(symbols);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Start a new process group so `force_stopped`/`stop` can kill the
        // whole tree, not just the immediate child.
        // SAFETY: pre_exec runs in the child after fork, before exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::StartupFailed(format!("failed to spawn debugger: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdin = child.stdin.take().expect("stdin was piped");

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let session_id = self.config.session_id.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(session = %session_id, %line, "cdb stdout");
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            tracing::debug!(session = %session_id, "cdb stdout reader exiting");
        });

        let session_id_err = self.config.session_id.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(session = %session_id_err, %line, "cdb stderr");
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.lines_rx.lock().await = Some(rx);
        *self.child.lock().await = Some(child);

        let startup = tokio::time::timeout(self.config.startup_timeout, self.wait_for_prompt()).await;
        match startup {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::StartupTimeout(self.config.startup_timeout)),
        }
    }

    async fn wait_for_prompt(&self) -> Result<(), CoreError> {
        let mut guard = self.lines_rx.lock().await;
        let rx = guard.as_mut().ok_or(CoreError::Disposed)?;
        loop {
            match rx.recv().await {
                Some(line) if detector::is_prompt(&line) => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(CoreError::StartupFailed(
                        "debugger exited before emitting a prompt".into(),
                    ))
                }
            }
        }
    }

    fn next_tag(&self) -> String {
        let counter = self.tag_counter.fetch_add(1, Ordering::SeqCst);
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{counter}-{suffix:08x}", self.config.session_id)
    }

    async fn write_stdin(&self, text: &str) -> Result<(), CoreError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(CoreError::NotActive)?;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| CoreError::ProcessDied(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| CoreError::ProcessDied(format!("stdin flush failed: {e}")))
    }

    /// Execute one command: write it plus a sentinel-emitting `.echo` command,
    /// then read until the sentinel is observed, an ultra-safe completion
    /// marker is observed, the timeout elapses, or the caller cancels.
    pub async fn execute(&self, command: &str, cancel: CancellationToken) -> Result<String, CoreError> {
        self.ensure_not_disposed()?;
        if cancel.is_cancelled() {
            // Cancelled while still queued: never touch stdin, so a queued-
            // but-cancelled command has no observable effect on the debugger.
            return Err(CoreError::CancelledByCaller);
        }
        {
            let mut state = self.state.lock().await;
            if *state != DriverState::Ready {
                return Err(CoreError::NotActive);
            }
            *state = DriverState::Executing;
        }

        let tag = self.next_tag();
        let sentinel_cmd = format!(".echo {tag}");
        let wrapper = format!("{command}\n{sentinel_cmd}\n");

        let outcome = match self.write_stdin(&wrapper).await {
            Ok(()) => self.read_until_complete(command, &sentinel_cmd, &tag, &cancel).await,
            Err(e) => Err(e),
        };

        // Ready unless the process has died -- a dead process should stay
        // unusable so the caller sees ProcessDied on the next attempt too.
        let mut state = self.state.lock().await;
        *state = match &outcome {
            Err(CoreError::ProcessDied(_)) => DriverState::Stopped,
            _ => DriverState::Ready,
        };

        outcome
    }

    async fn read_until_complete(
        &self,
        command: &str,
        sentinel_cmd: &str,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let mut content: Vec<String> = Vec::new();
        let deadline = tokio::time::sleep(self.config.command_timeout);
        tokio::pin!(deadline);

        let mut guard = self.lines_rx.lock().await;
        let rx = guard.as_mut().ok_or(CoreError::Disposed)?;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    drop(guard);
                    return match self.realign(tag).await {
                        Ok(()) => Err(CoreError::CancelledByCaller),
                        Err(e) => Err(e),
                    };
                }
                () = &mut deadline => {
                    return Err(CoreError::CommandTimeout(self.config.command_timeout));
                }
                line = rx.recv() => {
                    match line {
                        None => return Err(CoreError::ProcessDied("stdout closed".into())),
                        Some(line) => {
                            let trimmed = line.trim_end();
                            if trimmed == command || trimmed == sentinel_cmd {
                                continue; // echo-of-input suppression (§4.A step 4)
                            }
                            if detector::extract_sentinel(trimmed, tag) {
                                break;
                            }
                            if detector::is_ultra_safe_completion(trimmed) {
                                content.push(trimmed.to_string());
                                break;
                            }
                            content.push(trimmed.to_string());
                        }
                    }
                }
            }
        }

        Ok(content.join("\n").trim_end().to_string())
    }

    /// Best-effort cancellation recovery: inject a newline and a fresh
    /// sentinel, hoping to realign stdout within `disposal_timeout`. If the
    /// realignment sentinel never arrives, the driver (and by extension the
    /// owning session) is considered unusable.
    async fn realign(&self, previous_tag: &str) -> Result<(), CoreError> {
        let recovery_tag = format!("{previous_tag}-recover");
        let recovery_cmd = format!("\n.echo {recovery_tag}\n");
        self.write_stdin(&recovery_cmd).await?;

        let wait = tokio::time::timeout(self.config.disposal_timeout, async {
            let mut guard = self.lines_rx.lock().await;
            let rx = guard.as_mut().ok_or(CoreError::Disposed)?;
            loop {
                match rx.recv().await {
                    Some(line) if detector::extract_sentinel(line.trim_end(), &recovery_tag) => {
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => return Err(CoreError::ProcessDied("stdout closed during realign".into())),
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(CoreError::ProcessDied(
                "driver could not realign after cancellation".into(),
            )),
        }
    }

    /// Send quit, wait up to `disposal_timeout`, escalate to kill. Idempotent.
    pub async fn stop(&self) -> Result<(), CoreError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.state.lock().await = DriverState::Stopping;

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(self.config.disposal_timeout, child.wait())
                .await
                .is_err()
            {
                let _ = kill_process_group(&child);
                let _ = child.wait().await;
            }
        }

        *self.lines_rx.lock().await = None;
        *self.state.lock().await = DriverState::Stopped;
        tracing::info!(session = %self.config.session_id, "debugger stopped");
        Ok(())
    }

    async fn force_stopped(&self) {
        *self.state.lock().await = DriverState::Stopped;
        if let Some(child) = self.child.lock().await.take() {
            let _ = kill_process_group(&child);
        }
        *self.lines_rx.lock().await = None;
    }
}

#[async_trait]
impl CommandExecutor for ProcessDriver {
    async fn execute(&self, command: &str, cancel: CancellationToken) -> Result<String, CoreError> {
        ProcessDriver::execute(self, command, cancel).await
    }

    async fn stop(&self) -> Result<(), CoreError> {
        ProcessDriver::stop(self).await
    }
}

/// Send `SIGKILL` to the whole process group of a child spawned with
/// `setsid` (negative pid addresses the group, not just the leader).
fn kill_process_group(child: &Child) -> Result<(), CoreError> {
    let pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessDied("process has no pid (already exited?)".into()))?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-(pid as i32)),
        nix::sys::signal::Signal::SIGKILL,
    )
    .map_err(|e| CoreError::ProcessDied(format!("failed to kill process group: {e}")))
}

// ---------------------------------------------------------------------------
// Debugger binary resolution (§6)
// ---------------------------------------------------------------------------

/// Architecture-aware standard install locations for cdb.exe / windbg.exe,
/// searched in the order §6 specifies (x64, x86, arm64, arm).
#[must_use]
pub fn standard_install_locations() -> Vec<PathBuf> {
    const ARCHES: [&str; 4] = ["x64", "x86", "arm64", "arm"];
    ARCHES
        .iter()
        .map(|arch| {
            PathBuf::from(format!(
                r"C:\Program Files (x86)\Windows Kits\10\Debuggers\{arch}\cdb.exe"
            ))
        })
        .collect()
}

/// Resolve the debugger binary: explicit config path, then an environment
/// search path, then the architecture-aware standard locations. `exists` is
/// injected so this is unit-testable without touching the real filesystem.
pub fn resolve_debugger_binary(
    explicit_path: Option<&Path>,
    env_search_path: Option<&Path>,
    standard_locations: &[PathBuf],
    exists: impl Fn(&Path) -> bool,
) -> Result<PathBuf, CoreError> {
    if let Some(path) = explicit_path {
        return if exists(path) {
            Ok(path.to_path_buf())
        } else {
            Err(CoreError::ConfigInvalid(format!(
                "configured debugger path does not exist: {}",
                path.display()
            )))
        };
    }

    if let Some(path) = env_search_path {
        if exists(path) {
            return Ok(path.to_path_buf());
        }
    }

    for candidate in standard_locations {
        if exists(candidate) {
            return Ok(candidate.clone());
        }
    }

    Err(CoreError::ConfigInvalid(
        "debugger binary not found via explicit path, environment search, or standard install locations".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DriverConfig {
        DriverConfig {
            debugger_path: PathBuf::from("/usr/bin/true"),
            dump_path: PathBuf::from("/tmp/a.dmp"),
            symbols_path: None,
            command_timeout: Duration::from_secs(600),
            startup_timeout: Duration::from_secs(60),
            disposal_timeout: Duration::from_secs(30),
            startup_retries: 0,
            session_id: "sess-000001-deadbeef".into(),
        }
    }

    #[test]
    fn config_validate_rejects_zero_timeout() {
        let mut cfg = base_config();
        cfg.command_timeout = Duration::from_secs(0);
        assert!(matches!(cfg.validate(), Err(CoreError::ConfigInvalid(_))));
    }

    #[test]
    fn config_validate_rejects_negative_retries() {
        let mut cfg = base_config();
        cfg.startup_retries = -1;
        assert!(matches!(cfg.validate(), Err(CoreError::ConfigInvalid(_))));
    }

    #[test]
    fn config_validate_accepts_positive_timeouts() {
        assert!(base_config().validate().is_ok());
    }

    #[tokio::test]
    async fn new_driver_starts_idle() {
        let driver = ProcessDriver::new(base_config()).unwrap();
        assert_eq!(driver.state().await, DriverState::Idle);
    }

    #[test]
    fn resolve_prefers_explicit_path() {
        let explicit = PathBuf::from("/custom/cdb.exe");
        let result = resolve_debugger_binary(
            Some(&explicit),
            Some(Path::new("/env/cdb.exe")),
            &standard_install_locations(),
            |p| p == explicit,
        );
        assert_eq!(result.unwrap(), explicit);
    }

    #[test]
    fn resolve_explicit_path_missing_is_config_invalid() {
        let explicit = PathBuf::from("/custom/cdb.exe");
        let result = resolve_debugger_binary(Some(&explicit), None, &[], |_| false);
        assert!(matches!(result, Err(CoreError::ConfigInvalid(_))));
    }

    #[test]
    fn resolve_falls_back_to_env_path() {
        let env_path = PathBuf::from("/env/cdb.exe");
        let result = resolve_debugger_binary(None, Some(&env_path), &[], |p| p == env_path);
        assert_eq!(result.unwrap(), env_path);
    }

    #[test]
    fn resolve_falls_back_to_standard_locations_in_order() {
        let locations = standard_install_locations();
        let arm64 = locations[2].clone();
        let result = resolve_debugger_binary(None, None, &locations, |p| p == arm64);
        assert_eq!(result.unwrap(), arm64);
    }

    #[test]
    fn resolve_fails_when_nothing_found() {
        let result = resolve_debugger_binary(None, None, &standard_install_locations(), |_| false);
        assert!(matches!(result, Err(CoreError::ConfigInvalid(_))));
    }
}
