//! Integration tests for the resource-service helpers in `resources.rs`,
//! exercised against a session opened with a real dump file on disk.

use nexus_dump_server::config::ServerConfig;
use nexus_dump_server::manager::SessionManager;
use nexus_dump_server::notify::NotificationBus;
use nexus_dump_server::resources;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

fn fixture_path() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_cdb.sh"))
}

#[tokio::test]
async fn dump_info_reports_size_and_existence_for_a_real_file() {
    let mut dump_file = tempfile::NamedTempFile::new().unwrap();
    dump_file.write_all(b"not a real minidump, just filler bytes").unwrap();
    let dump_path = dump_file.path().to_string_lossy().to_string();

    let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
    let session = manager.create(dump_path.clone(), None, fixture_path()).await.unwrap();

    let info = resources::dump_info(&manager, session.session_id()).await.unwrap();
    assert_eq!(info.dump_path, dump_path);
    assert!(info.exists);
    assert_eq!(info.size_bytes, Some(38));
    assert!(info.modified.is_some());

    manager.close(session.session_id()).await.unwrap();
}

#[tokio::test]
async fn dump_info_reports_nonexistence_for_a_file_removed_after_session_open() {
    // `Session::open` validates the dump path exists *at creation time*; it
    // doesn't re-validate on every read, so a file removed afterward is a
    // legitimate way for `dump_info` to observe `exists == false`.
    let dump_file = tempfile::NamedTempFile::new().unwrap();
    let dump_path = dump_file.path().to_string_lossy().to_string();

    let manager = SessionManager::new(ServerConfig::default(), Arc::new(NotificationBus::new()));
    let session = manager.create(dump_path, None, fixture_path()).await.unwrap();

    dump_file.close().unwrap();

    let info = resources::dump_info(&manager, session.session_id()).await.unwrap();
    assert!(!info.exists);
    assert!(info.size_bytes.is_none());

    manager.close(session.session_id()).await.unwrap();
}
