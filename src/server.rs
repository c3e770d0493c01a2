//! `rmcp` wiring: the four canonical tools (§6) plus resource reads.
//!
//! Grounded directly on `examples/sanjay920-agentsh/src/server.rs` --
//! parameter structs, `#[tool_router]`/`#[tool_handler]`, the
//! `json_content`/`err_result` helper shape, and `ServerInfo` construction in
//! `get_info`, generalized from agentsh's shell/session tools to the four
//! dump-analysis tools this spec defines.

use crate::config::ServerConfig;
use crate::driver::{resolve_debugger_binary, standard_install_locations};
use crate::error::CoreError;
use crate::manager::SessionManager;
use crate::notify::{NotificationBus, NotificationEvent, SessionEventKind};
use crate::queue::CommandState;
use crate::resources;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::service::{NotificationContext, Peer, RequestContext};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string(value)
        .map_err(|e| McpError::internal_error(format!("failed to serialize result: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

/// Map a `CoreError` onto the tool-error shape §7 requires: `-32603` with a
/// human-readable message, except `InvalidArgument` which callers reach
/// through `-32602` (handled by `rmcp`'s own parameter validation plus the
/// explicit checks below).
fn err_result(err: CoreError) -> McpError {
    match err {
        CoreError::InvalidArgument(msg) => McpError::invalid_params(msg, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct OpenSessionParams {
    /// Path to the crash dump file to analyze.
    pub dump_path: String,
    /// Optional path to a local symbols directory.
    #[serde(default)]
    pub symbols_path: Option<String>,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
pub struct OpenSessionResult {
    pub session_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct AsyncCommandParams {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
pub struct AsyncCommandResult {
    pub command_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandStatusParams {
    pub command_id: String,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
pub struct CommandStatusResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CloseSessionParams {
    pub session_id: String,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
pub struct CloseSessionResult {
    pub success: bool,
}

/// Status polling needs to look a command up by id across the whole process,
/// not just within one session -- this table is the cheap way to do that
/// without making every session scan every other session's queue.
struct CommandLocator {
    manager: Arc<SessionManager>,
}

impl CommandLocator {
    async fn status(&self, command_id: &str) -> Result<CommandStatusResult, CoreError> {
        let session_id = session_id_from_command_id(command_id)
            .ok_or_else(|| CoreError::CommandNotFound(command_id.to_string()))?;
        let session = self.manager.get(&session_id)?;
        let record = session.command_status(command_id).await?;
        Ok(match record.state {
            CommandState::Queued => CommandStatusResult {
                status: "queued".into(),
                result: None,
                error: None,
            },
            CommandState::Executing => CommandStatusResult {
                status: "executing".into(),
                result: None,
                error: None,
            },
            CommandState::Completed { output } => CommandStatusResult {
                status: "completed".into(),
                result: Some(output),
                error: None,
            },
            CommandState::Failed { message } => CommandStatusResult {
                status: "failed".into(),
                result: None,
                error: Some(message),
            },
            CommandState::Cancelled => CommandStatusResult {
                status: "cancelled".into(),
                result: None,
                error: None,
            },
            CommandState::TimedOut => CommandStatusResult {
                status: "timed_out".into(),
                result: None,
                error: Some("command timed out".into()),
            },
        })
    }
}

/// `cmd-<session_id>-NNNN`; `session_id` is itself `sess-NNNNNN-XXXXXXXX`, so
/// strip the leading `cmd-` and trailing `-NNNN` rather than splitting on `-`.
fn session_id_from_command_id(command_id: &str) -> Option<String> {
    let rest = command_id.strip_prefix("cmd-")?;
    let (session_id, _seq) = rest.rsplit_once('-')?;
    Some(session_id.to_string())
}

#[derive(Clone)]
pub struct NexusServer {
    manager: Arc<SessionManager>,
    notify: Arc<NotificationBus>,
    config: ServerConfig,
    tool_router: ToolRouter<NexusServer>,
    /// Set once the client completes its `notifications/initialized`
    /// handshake (`on_initialized` below); `None` until then, so events
    /// published before a client attaches are logged but not pushed.
    peer: Arc<OnceLock<Peer<RoleServer>>>,
}

/// Map a session lifecycle transition onto a short label for the client-
/// facing notification payload. `ProcessDied` is an internal-only signal
/// the manager reacts to by closing the session; the `Closed` event that
/// follows shortly after is what the client actually sees, so it is
/// deliberately not forwarded here.
fn session_event_label(kind: SessionEventKind) -> Option<&'static str> {
    match kind {
        SessionEventKind::Created => Some("created"),
        SessionEventKind::Closed | SessionEventKind::Disposed => Some("closed"),
        SessionEventKind::Expired => Some("expired"),
        SessionEventKind::ProcessDied => None,
    }
}

/// Forward bus events to the connected client as logging notifications, the
/// one notification channel `rmcp` exposes generically rather than as a
/// closed, schema-typed enum -- our custom `commandStatus`/`sessionEvent`
/// payloads ride inside `data` with a `kind` discriminant. Always logs via
/// `tracing` too, regardless of whether a peer is attached yet.
fn spawn_notification_delivery(notify: Arc<NotificationBus>, peer: Arc<OnceLock<Peer<RoleServer>>>) {
    let mut rx = notify.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification delivery lagged, events dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            tracing::info!(?event, "notification");

            let Some(peer) = peer.get() else { continue };
            let data = match &event {
                NotificationEvent::CommandStatus(e) => json!({
                    "kind": "commandStatus",
                    "sessionId": e.session_id,
                    "commandId": e.command_id,
                    "state": e.state,
                }),
                NotificationEvent::Session(e) => {
                    let Some(label) = session_event_label(e.kind) else { continue };
                    json!({
                        "kind": "sessionEvent",
                        "sessionId": e.session_id,
                        "state": label,
                    })
                }
            };

            let param = LoggingMessageNotificationParam {
                level: LoggingLevel::Info,
                logger: Some("nexus-dump-server".to_string()),
                data,
            };
            if let Err(e) = peer.notify_logging_message(param).await {
                tracing::debug!(error = %e, "failed to push notification to client");
            }
        }
    });
}

impl NexusServer {
    /// Build the server and start forwarding bus events both to the log and,
    /// once a client has attached (`on_initialized`), to the client itself as
    /// `notifications/message` logging notifications (see
    /// `spawn_notification_delivery`).
    #[must_use]
    pub fn new(config: ServerConfig, manager: Arc<SessionManager>, notify: Arc<NotificationBus>) -> Self {
        let peer = Arc::new(OnceLock::new());
        spawn_notification_delivery(Arc::clone(&notify), Arc::clone(&peer));
        Self {
            manager,
            notify,
            config,
            tool_router: Self::tool_router(),
            peer,
        }
    }

    fn resolve_debugger_path(&self) -> Result<PathBuf, CoreError> {
        let explicit = self.config.debugger_path.as_ref().map(PathBuf::from);
        let env_path = std::env::var("NEXUS_DEBUGGER_SEARCH_PATH").ok().map(PathBuf::from);
        resolve_debugger_binary(
            explicit.as_deref(),
            env_path.as_deref(),
            &standard_install_locations(),
            |p| p.exists(),
        )
    }
}

#[tool_router]
impl NexusServer {
    #[tool(description = "Open a new crash-dump analysis session against a dump file")]
    async fn nexus_open_dump_analyze_session(
        &self,
        Parameters(params): Parameters<OpenSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.dump_path.trim().is_empty() {
            return Err(McpError::invalid_params("dump_path must not be empty", None));
        }

        let debugger_path = self.resolve_debugger_path().map_err(err_result)?;
        let session = self
            .manager
            .create(params.dump_path, params.symbols_path, debugger_path)
            .await
            .map_err(err_result)?;

        json_content(&OpenSessionResult {
            session_id: session.session_id().to_string(),
        })
    }

    #[tool(description = "Enqueue a debugger command against an open session; returns a command id immediately")]
    async fn nexus_dump_analyze_session_async_command(
        &self,
        Parameters(params): Parameters<AsyncCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.session_id.trim().is_empty() {
            return Err(McpError::invalid_params("session_id must not be empty", None));
        }
        if params.command.trim().is_empty() {
            return Err(McpError::invalid_params("command must not be empty", None));
        }

        let session = self.manager.get(&params.session_id).map_err(err_result)?;
        let command_id = session.submit_command(params.command).await.map_err(err_result)?;

        json_content(&AsyncCommandResult { command_id })
    }

    #[tool(description = "Poll the status of a previously enqueued command")]
    async fn nexus_dump_analyze_session_async_command_status(
        &self,
        Parameters(params): Parameters<CommandStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.command_id.trim().is_empty() {
            return Err(McpError::invalid_params("command_id must not be empty", None));
        }

        let locator = CommandLocator {
            manager: Arc::clone(&self.manager),
        };
        let status = locator.status(&params.command_id).await.map_err(err_result)?;
        json_content(&status)
    }

    #[tool(description = "Close a dump analysis session and release its debugger process")]
    async fn nexus_close_dump_analyze_session(
        &self,
        Parameters(params): Parameters<CloseSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.session_id.trim().is_empty() {
            return Err(McpError::invalid_params("session_id must not be empty", None));
        }

        match self.manager.close(&params.session_id).await {
            Ok(()) => json_content(&CloseSessionResult { success: true }),
            Err(CoreError::SessionNotFound(_)) => json_content(&CloseSessionResult { success: false }),
            Err(e) => Err(err_result(e)),
        }
    }
}

#[tool_handler]
impl ServerHandler for NexusServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "nexus-dump-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Drives a Windows crash-dump debugger (CDB/WinDbg). Open a session with \
                 nexus_open_dump_analyze_session, enqueue debugger commands with \
                 nexus_dump_analyze_session_async_command, poll results with \
                 nexus_dump_analyze_session_async_command_status, and close the session \
                 with nexus_close_dump_analyze_session when finished."
                    .into(),
            ),
        }
    }

    /// Fired once the client completes the `notifications/initialized`
    /// handshake; captures the peer handle so
    /// `spawn_notification_delivery` can start pushing client-facing
    /// notifications instead of only logging them.
    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        let _ = self.peer.set(context.peer);
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let mut resources = vec![
            RawResource::new("debugging://sessions/active", "Active sessions").no_annotation(),
            RawResource::new(resources::DOC_DEBUGGING_WORKFLOWS_URI, "Debugging workflows").no_annotation(),
            RawResource::new(resources::DOC_TROUBLESHOOTING_URI, "Troubleshooting").no_annotation(),
        ];
        for session in self.manager.list_active() {
            resources.push(
                RawResource::new(
                    format!("debugging://sessions/{}", session.session_id()),
                    format!("Session {}", session.session_id()),
                )
                .no_annotation(),
            );
        }
        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.as_str();

        if let Some(body) = resources::static_doc(uri) {
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(body, uri)],
            });
        }

        if uri == "debugging://sessions/active" {
            let doc = resources::active_sessions(&self.manager);
            let body = serde_json::to_string(&doc)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(body, uri)],
            });
        }

        if let Some(session_id) = uri
            .strip_prefix("debugging://sessions/")
            .and_then(|rest| rest.strip_suffix("/dump-info"))
        {
            let info = resources::dump_info(&self.manager, session_id)
                .await
                .map_err(err_result)?;
            let body =
                serde_json::to_string(&info).map_err(|e| McpError::internal_error(e.to_string(), None))?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(body, uri)],
            });
        }

        if let Some(session_id) = uri.strip_prefix("debugging://sessions/") {
            let detail = resources::session_detail(&self.manager, session_id).map_err(err_result)?;
            let body = serde_json::to_string(&detail)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(body, uri)],
            });
        }

        if let Some(session_id) = uri.strip_prefix("debugging://commands/history/") {
            let history = resources::command_history(&self.manager, session_id)
                .await
                .map_err(err_result)?;
            let body = serde_json::to_string(&json!({ "history": history }))
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(body, uri)],
            });
        }

        Err(McpError::resource_not_found(
            format!("no such resource: {uri}"),
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_extracted_from_command_id() {
        assert_eq!(
            session_id_from_command_id("cmd-sess-000001-deadbeef-0007"),
            Some("sess-000001-deadbeef".to_string())
        );
    }

    #[test]
    fn malformed_command_id_yields_none() {
        assert_eq!(session_id_from_command_id("not-a-command-id"), None);
        assert_eq!(session_id_from_command_id("cmd-"), None);
    }
}
