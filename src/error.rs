//! Error taxonomy for the core (driver, queue, session, manager).
//!
//! Every fallible core operation returns `Result<T, CoreError>`. The server
//! boundary (`server.rs`) maps `CoreError` onto JSON-RPC codes and tool-error
//! text; command-scoped failures (timeout, cancellation) are instead folded
//! into `queue::CommandState` and never reach the JSON-RPC layer as errors.

use thiserror::Error;

/// JSON-RPC 2.0 reserved error codes, surfaced through `json_rpc_code` below.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// The conceptual error kinds from spec §7, independent of how they are
/// eventually framed on the wire.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session '{0}' is closing")]
    SessionClosing(String),

    #[error("capacity exceeded: {running}/{max} sessions active")]
    CapacityExceeded { running: usize, max: usize },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("debugger startup failed: {0}")]
    StartupFailed(String),

    #[error("debugger startup timed out after {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("debugger process died: {0}")]
    ProcessDied(String),

    #[error("debugger is not active")]
    NotActive,

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("command was cancelled")]
    CancelledByCaller,

    #[error("driver has been disposed")]
    Disposed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map a `CoreError` onto the JSON-RPC error code the tool layer (§6/§7)
    /// must surface it as.
    #[must_use]
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            CoreError::InvalidArgument(_) => rpc_code::INVALID_PARAMS,
            _ => rpc_code::INTERNAL_ERROR,
        }
    }

    /// Whether this error represents a command-scoped, session-surviving
    /// failure (§7: "command terminal state, session survives") rather than
    /// a structural failure that should be reported to the caller directly.
    #[must_use]
    pub fn is_command_scoped(&self) -> bool {
        matches!(
            self,
            CoreError::CommandTimeout(_) | CoreError::CancelledByCaller
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_invalid_params() {
        let e = CoreError::InvalidArgument("empty command".into());
        assert_eq!(e.json_rpc_code(), rpc_code::INVALID_PARAMS);
    }

    #[test]
    fn session_not_found_maps_to_internal_error() {
        let e = CoreError::SessionNotFound("sess-000001-deadbeef".into());
        assert_eq!(e.json_rpc_code(), rpc_code::INTERNAL_ERROR);
    }

    #[test]
    fn command_scoped_errors_are_identified() {
        assert!(CoreError::CommandTimeout(std::time::Duration::from_secs(1)).is_command_scoped());
        assert!(CoreError::CancelledByCaller.is_command_scoped());
        assert!(!CoreError::ProcessDied("exit".into()).is_command_scoped());
    }
}
