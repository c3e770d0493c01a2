//! Server configuration: timeouts, caps, and retention, with env overrides.
//!
//! Configuration *loading* (files, flags) is an external collaborator (spec
//! §1); this module only owns the values themselves and their defaults, read
//! from the process environment the way `process::stripped_env_vars` does in
//! the teacher crate.

use crate::error::CoreError;
use std::time::Duration;

/// All tunables from spec §5, with the defaults spec.md lists.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-command execution timeout (§5: default 10 min).
    pub command_timeout: Duration,
    /// Time allowed for the debugger to emit its first prompt (§5: 60 s).
    pub startup_timeout: Duration,
    /// Time allowed for graceful shutdown before escalating (§5: 30 s).
    pub disposal_timeout: Duration,
    /// Idle duration after which a session is expired (§5: 30 min).
    pub session_idle_timeout: Duration,
    /// Interval between expiry sweeps (§5: 5 min).
    pub cleanup_interval: Duration,
    /// Maximum number of concurrently open sessions (§3 SessionTable).
    pub max_concurrent_sessions: usize,
    /// How long terminal commands are retained at minimum (§3: T_retain, 15 min).
    pub retain_duration: Duration,
    /// Upper bound on retained terminal command entries (§3: N_max, 1000).
    pub retain_max_entries: usize,
    /// Explicit path to the debugger binary, if configured (§6 resolution
    /// order: explicit config path first).
    pub debugger_path: Option<String>,
    /// Extra debugger spawn+first-prompt attempts after the first fails
    /// (§4.A: "retries non-negative").
    pub startup_retries: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10 * 60),
            startup_timeout: Duration::from_secs(60),
            disposal_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_concurrent_sessions: 10,
            retain_duration: Duration::from_secs(15 * 60),
            retain_max_entries: 1000,
            debugger_path: None,
            startup_retries: 2,
        }
    }
}

impl ServerConfig {
    /// Build configuration from defaults, overridden by environment
    /// variables when present. Unparseable overrides are ignored (fall back
    /// to default) rather than failing construction; `validate()` is the
    /// single point that rejects bad values.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = env_u64("NEXUS_COMMAND_TIMEOUT_SECS") {
            cfg.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("NEXUS_STARTUP_TIMEOUT_SECS") {
            cfg.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("NEXUS_DISPOSAL_TIMEOUT_SECS") {
            cfg.disposal_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("NEXUS_SESSION_IDLE_TIMEOUT_SECS") {
            cfg.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("NEXUS_CLEANUP_INTERVAL_SECS") {
            cfg.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("NEXUS_MAX_CONCURRENT_SESSIONS") {
            cfg.max_concurrent_sessions = n;
        }
        if let Some(secs) = env_u64("NEXUS_RETAIN_DURATION_SECS") {
            cfg.retain_duration = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("NEXUS_RETAIN_MAX_ENTRIES") {
            cfg.retain_max_entries = n;
        }
        if let Ok(path) = std::env::var("NEXUS_DEBUGGER_PATH") {
            if !path.trim().is_empty() {
                cfg.debugger_path = Some(path);
            }
        }
        if let Some(n) = env_i64("NEXUS_STARTUP_RETRIES") {
            cfg.startup_retries = n;
        }

        cfg
    }

    /// Validate the configuration, matching §4.A's construction contract:
    /// all timeouts must be strictly positive.
    pub fn validate(&self) -> Result<(), CoreError> {
        let checks: &[(&str, Duration)] = &[
            ("command_timeout", self.command_timeout),
            ("startup_timeout", self.startup_timeout),
            ("disposal_timeout", self.disposal_timeout),
            ("session_idle_timeout", self.session_idle_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("retain_duration", self.retain_duration),
        ];
        for (name, value) in checks {
            if value.is_zero() {
                return Err(CoreError::ConfigInvalid(format!(
                    "{name} must be positive, got {value:?}"
                )));
            }
        }
        if self.max_concurrent_sessions == 0 {
            return Err(CoreError::ConfigInvalid(
                "max_concurrent_sessions must be positive".into(),
            ));
        }
        if self.retain_max_entries == 0 {
            return Err(CoreError::ConfigInvalid(
                "retain_max_entries must be positive".into(),
            ));
        }
        if self.startup_retries < 0 {
            return Err(CoreError::ConfigInvalid(
                "startup_retries must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
