//! Entry point for the nexus-dump-server MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), builds the session manager and notification bus, starts the
//! background expiry sweep, then serves on stdin/stdout.

use anyhow::Result;
use nexus_dump_server::config::ServerConfig;
use nexus_dump_server::manager::SessionManager;
use nexus_dump_server::notify::NotificationBus;
use nexus_dump_server::server::NexusServer;
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting nexus-dump-server MCP server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    config.validate()?;

    let notify = Arc::new(NotificationBus::new());
    let manager = SessionManager::new(config.clone(), Arc::clone(&notify));
    manager.spawn_cleanup_task();
    let shutdown_manager = Arc::clone(&manager);

    let server = NexusServer::new(config, manager, notify);
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, cancelling outstanding work");
            shutdown_manager.shutdown();
        }
    }

    tracing::info!("nexus-dump-server shut down");
    Ok(())
}
