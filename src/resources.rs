//! Resource service backing `resources/list` / `resources/read` (§6):
//! per-session introspection plus two static documentation payloads.
//!
//! Grounded on the teacher's `registry::list`/`status` (small `Serialize`
//! summary DTOs built from live state) and `session::SessionInfo`.

use crate::error::CoreError;
use crate::manager::SessionManager;
use serde::Serialize;
use std::sync::Arc;

pub const DOC_DEBUGGING_WORKFLOWS_URI: &str = "debugging://docs/debugging-workflows";
pub const DOC_TROUBLESHOOTING_URI: &str = "debugging://docs/troubleshooting";

const DEBUGGING_WORKFLOWS_DOC: &str = r#"{
  "title": "Debugging workflows",
  "workflows": [
    {
      "name": "Triage a crash",
      "steps": [
        "nexus_open_dump_analyze_session with the dump path",
        "run '!analyze -v' via nexus_dump_analyze_session_async_command",
        "poll nexus_dump_analyze_session_async_command_status until terminal",
        "inspect the faulting thread with '~* k'",
        "nexus_close_dump_analyze_session when done"
      ]
    },
    {
      "name": "Inspect a specific thread",
      "steps": [
        "~<n>s to switch threads",
        "k or kb for the call stack",
        "dv for local variables if private symbols are available"
      ]
    }
  ]
}"#;

const TROUBLESHOOTING_DOC: &str = r#"{
  "title": "Troubleshooting",
  "entries": [
    {
      "symptom": "command status never reaches a terminal state",
      "likely_cause": "the debugger is waiting on a prompt the command didn't satisfy, or it is genuinely still running",
      "action": "check command_timeout; long '!analyze -v' runs on large dumps can legitimately take minutes"
    },
    {
      "symptom": "SessionNotFound shortly after creation",
      "likely_cause": "the session idle-timed out, or it was explicitly closed by another caller",
      "action": "open a new session; sessions are not resurrected"
    },
    {
      "symptom": "CapacityExceeded on open",
      "likely_cause": "max_concurrent_sessions reached",
      "action": "close unused sessions or raise NEXUS_MAX_CONCURRENT_SESSIONS"
    }
  ]
}"#;

/// One command in a session's retained history, as exposed to resource reads.
#[derive(Debug, Serialize)]
pub struct CommandHistoryEntry {
    pub command_id: String,
    pub command_text: String,
    pub state: String,
}

/// Summary of one active session (§6 `debugging://sessions/{sessionId}`).
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub dump_path: String,
    pub symbols_path: Option<String>,
    pub status: String,
}

/// List of active sessions (§6 `debugging://sessions/active`).
#[derive(Debug, Serialize)]
pub struct ActiveSessionsDoc {
    pub sessions: Vec<SessionSummary>,
}

fn session_status_label(status: crate::session::SessionStatus) -> &'static str {
    match status {
        crate::session::SessionStatus::Initializing => "initializing",
        crate::session::SessionStatus::Active => "active",
        crate::session::SessionStatus::Disposing => "disposing",
        crate::session::SessionStatus::Disposed => "disposed",
    }
}

/// Build the `debugging://sessions/active` payload.
#[must_use]
pub fn active_sessions(manager: &Arc<SessionManager>) -> ActiveSessionsDoc {
    let sessions = manager
        .list_active()
        .into_iter()
        .map(|s| SessionSummary {
            session_id: s.session_id().to_string(),
            dump_path: s.metadata.dump_path.clone(),
            symbols_path: s.metadata.symbols_path.clone(),
            status: session_status_label(s.status()).to_string(),
        })
        .collect();
    ActiveSessionsDoc { sessions }
}

/// Build the `debugging://sessions/{sessionId}` payload.
pub fn session_detail(
    manager: &Arc<SessionManager>,
    session_id: &str,
) -> Result<SessionSummary, CoreError> {
    let session = manager.get(session_id)?;
    Ok(SessionSummary {
        session_id: session.session_id().to_string(),
        dump_path: session.metadata.dump_path.clone(),
        symbols_path: session.metadata.symbols_path.clone(),
        status: session_status_label(session.status()).to_string(),
    })
}

/// Build the `debugging://commands/history/{sessionId}` payload.
pub async fn command_history(
    manager: &Arc<SessionManager>,
    session_id: &str,
) -> Result<Vec<CommandHistoryEntry>, CoreError> {
    let session = manager.get(session_id)?;
    let history = session
        .command_history()
        .await
        .into_iter()
        .map(|r| CommandHistoryEntry {
            command_id: r.command_id,
            command_text: r.command_text,
            state: format!("{:?}", r.state),
        })
        .collect();
    Ok(history)
}

/// Resolve one of the two static documentation URIs to its JSON body.
#[must_use]
pub fn static_doc(uri: &str) -> Option<&'static str> {
    match uri {
        DOC_DEBUGGING_WORKFLOWS_URI => Some(DEBUGGING_WORKFLOWS_DOC),
        DOC_TROUBLESHOOTING_URI => Some(TROUBLESHOOTING_DOC),
        _ => None,
    }
}

/// Dump file metadata for `debugging://sessions/{sessionId}/dump-info`:
/// size, modification time, and existence, read fresh on every call since
/// the dump file lives outside our control.
#[derive(Debug, Serialize)]
pub struct DumpInfo {
    pub dump_path: String,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub modified: Option<String>,
}

pub async fn dump_info(manager: &Arc<SessionManager>, session_id: &str) -> Result<DumpInfo, CoreError> {
    let session = manager.get(session_id)?;
    let dump_path = session.metadata.dump_path.clone();

    match tokio::fs::metadata(&dump_path).await {
        Ok(meta) => Ok(DumpInfo {
            dump_path,
            exists: true,
            size_bytes: Some(meta.len()),
            modified: meta.modified().ok().map(format_system_time),
        }),
        Err(_) => Ok(DumpInfo {
            dump_path,
            exists: false,
            size_bytes: None,
            modified: None,
        }),
    }
}

fn format_system_time(time: std::time::SystemTime) -> String {
    let secs = time
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    humanize_unix_timestamp(secs)
}

/// Format a Unix timestamp as `yyyy-MM-dd HH:mm:ss UTC` (§6).
fn humanize_unix_timestamp(secs: u64) -> String {
    use chrono::{DateTime, Utc};
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs as i64, 0).unwrap_or_default();
    format!("{} UTC", dt.format("%Y-%m-%d %H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_docs_are_valid_json() {
        for uri in [DOC_DEBUGGING_WORKFLOWS_URI, DOC_TROUBLESHOOTING_URI] {
            let body = static_doc(uri).expect("doc should resolve");
            let _: serde_json::Value = serde_json::from_str(body).expect("doc should be valid JSON");
        }
    }

    #[test]
    fn unknown_doc_uri_resolves_to_none() {
        assert!(static_doc("debugging://docs/does-not-exist").is_none());
    }

    #[tokio::test]
    async fn active_sessions_is_empty_for_a_fresh_manager() {
        let manager = SessionManager::new(
            crate::config::ServerConfig::default(),
            Arc::new(crate::notify::NotificationBus::new()),
        );
        let doc = active_sessions(&manager);
        assert!(doc.sessions.is_empty());
    }

    #[tokio::test]
    async fn session_detail_for_unknown_id_is_not_found() {
        let manager = SessionManager::new(
            crate::config::ServerConfig::default(),
            Arc::new(crate::notify::NotificationBus::new()),
        );
        let err = session_detail(&manager, "sess-999999-deadbeef").unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[test]
    fn humanize_formats_unix_epoch() {
        assert_eq!(humanize_unix_timestamp(0), "1970-01-01 00:00:00 UTC");
    }

    #[test]
    fn humanize_formats_a_known_timestamp() {
        // 2021-01-01 00:00:00 UTC
        assert_eq!(humanize_unix_timestamp(1_609_459_200), "2021-01-01 00:00:00 UTC");
    }
}
