//! Integration tests for `Session`, driven against a small fixture script
//! standing in for cdb.exe (see `tests/fixtures/fake_cdb.sh`) rather than a
//! real debugger binary.

use nexus_dump_server::notify::{NotificationBus, SessionEventKind};
use nexus_dump_server::queue::CommandState;
use nexus_dump_server::session::Session;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fixture_path() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_cdb.sh"))
}

/// A dump path that actually exists as a file, the way `Session::open`'s
/// validation now requires. Kept (not deleted) since only the path, not the
/// guard, is handed to the session.
fn real_dump_path() -> String {
    let path = tempfile::NamedTempFile::new()
        .unwrap()
        .into_temp_path()
        .keep()
        .unwrap();
    path.to_string_lossy().to_string()
}

async fn open_session(command_timeout: Duration) -> Arc<Session> {
    Session::open(
        "sess-000001-deadbeef".into(),
        real_dump_path(),
        None,
        fixture_path(),
        command_timeout,
        Duration::from_secs(5),
        Duration::from_secs(5),
        0,
        Duration::from_secs(900),
        1000,
        Arc::new(NotificationBus::new()),
        CancellationToken::new(),
    )
    .await
    .expect("fixture debugger should start")
}

async fn wait_terminal(session: &Session, command_id: &str) -> CommandState {
    loop {
        let record = session.command_status(command_id).await.unwrap();
        if record.state.is_terminal() {
            return record.state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_with_output() {
    let session = open_session(Duration::from_secs(5)).await;

    let id = session.submit_command("k").await.unwrap();
    let state = wait_terminal(&session, &id).await;

    match state {
        CommandState::Completed { output } => assert!(output.contains("stub output for: k")),
        other => panic!("expected Completed, got {other:?}"),
    }

    session.dispose(SessionEventKind::Closed).await.unwrap();
}

#[tokio::test]
async fn command_times_out_when_debugger_never_replies() {
    let session = open_session(Duration::from_millis(200)).await;

    let id = session.submit_command("hang").await.unwrap();
    let state = wait_terminal(&session, &id).await;

    assert_eq!(state, CommandState::TimedOut);

    session.dispose(SessionEventKind::Closed).await.unwrap();
}

#[tokio::test]
async fn cancelling_a_still_queued_command_never_executes_it() {
    let session = open_session(Duration::from_secs(5)).await;

    // A keeps the single executor busy for ~300ms so B is still Queued when
    // we cancel it.
    let a = session.submit_command("slow").await.unwrap();
    let b = session.submit_command("k").await.unwrap();
    let c = session.submit_command("k").await.unwrap();

    session.cancel_command(&b).await.unwrap();

    assert_eq!(wait_terminal(&session, &a).await, CommandState::Completed { output: String::new() });
    assert_eq!(wait_terminal(&session, &b).await, CommandState::Cancelled);
    match wait_terminal(&session, &c).await {
        CommandState::Completed { output } => assert!(output.contains("stub output for: k")),
        other => panic!("expected C to complete normally, got {other:?}"),
    }

    session.dispose(SessionEventKind::Closed).await.unwrap();
}

#[tokio::test]
async fn process_death_fails_the_running_command_and_cancels_the_rest() {
    let session = open_session(Duration::from_secs(5)).await;

    let x = session.submit_command("die").await.unwrap();
    let y = session.submit_command("k").await.unwrap();
    let z = session.submit_command("k").await.unwrap();

    match wait_terminal(&session, &x).await {
        CommandState::Failed { .. } => {}
        other => panic!("expected X to fail, got {other:?}"),
    }
    assert_eq!(wait_terminal(&session, &y).await, CommandState::Cancelled);
    assert_eq!(wait_terminal(&session, &z).await, CommandState::Cancelled);

    session.dispose(SessionEventKind::Closed).await.ok();
}
