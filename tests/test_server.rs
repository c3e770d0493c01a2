//! Integration tests for the MCP server tools via duplex transport.
//!
//! Mirrors the teacher's `tests/test_server.rs`: `tokio::io::duplex` wires an
//! in-process client straight to the server, so the whole JSON-RPC/tool-call
//! path is exercised without stdio. The debugger subprocess itself is the
//! fixture script in `tests/fixtures/fake_cdb.sh`, wired in through
//! `ServerConfig::debugger_path` so no real cdb.exe is needed.

use nexus_dump_server::config::ServerConfig;
use nexus_dump_server::manager::SessionManager;
use nexus_dump_server::notify::NotificationBus;
use nexus_dump_server::server::NexusServer;
use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

fn fixture_config() -> ServerConfig {
    ServerConfig {
        debugger_path: Some(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_cdb.sh").to_string()),
        ..ServerConfig::default()
    }
}

async fn setup() -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let config = fixture_config();
    let notify = Arc::new(NotificationBus::new());
    let manager = SessionManager::new(config.clone(), Arc::clone(&notify));
    let server = NexusServer::new(config, manager, notify);
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

async fn poll_status(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    command_id: &str,
) -> Value {
    loop {
        let status = call_tool(
            client,
            "nexus_dump_analyze_session_async_command_status",
            serde_json::json!({ "command_id": command_id }),
        )
        .await;
        match status["status"].as_str().unwrap() {
            "queued" | "executing" => tokio::time::sleep(Duration::from_millis(10)).await,
            _ => return status,
        }
    }
}

#[tokio::test]
async fn full_session_lifecycle_over_mcp() {
    let client = setup().await;

    let dump_file = tempfile::NamedTempFile::new().unwrap();
    let dump_path = dump_file.path().to_string_lossy().to_string();
    let opened = call_tool(
        &client,
        "nexus_open_dump_analyze_session",
        serde_json::json!({ "dump_path": dump_path }),
    )
    .await;
    let session_id = opened["session_id"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("sess-"));

    let submitted = call_tool(
        &client,
        "nexus_dump_analyze_session_async_command",
        serde_json::json!({ "session_id": session_id, "command": "k" }),
    )
    .await;
    let command_id = submitted["command_id"].as_str().unwrap().to_string();
    assert!(command_id.starts_with("cmd-"));

    let status = poll_status(&client, &command_id).await;
    assert_eq!(status["status"], "completed");
    assert!(status["result"].as_str().unwrap().contains("stub output for: k"));

    let closed = call_tool(
        &client,
        "nexus_close_dump_analyze_session",
        serde_json::json!({ "session_id": session_id }),
    )
    .await;
    assert_eq!(closed["success"], true);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn closing_an_unknown_session_reports_failure_not_an_error() {
    let client = setup().await;

    let closed = call_tool(
        &client,
        "nexus_close_dump_analyze_session",
        serde_json::json!({ "session_id": "sess-999999-deadbeef" }),
    )
    .await;
    assert_eq!(closed["success"], false);

    client.cancel().await.unwrap();
}

