//! Integration tests for the connection registry through the manager.

use async_sqlite_manager::models::{AccessMode, QueryRequest, ReturnShape};
use async_sqlite_manager::{DbError, Manager, ManagerConfig};
use tempfile::TempDir;

fn db_path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[tokio::test]
async fn test_alias_rebinding() {
    let dir = tempfile::tempdir().unwrap();
    let p1 = db_path(&dir, "one.db");
    let p2 = db_path(&dir, "two.db");
    let manager = Manager::new(ManagerConfig::default());

    let first = manager.connect(&p1, Some("A"), false).await.unwrap();
    let second = manager.connect(&p2, Some("A"), false).await.unwrap();

    let via_alias = manager.get_connection("A", AccessMode::Write).await.unwrap();
    assert!(via_alias.same_as(second.write_handle()));
    assert!(!via_alias.same_as(first.write_handle()));

    let via_path = manager.get_connection(&p1, AccessMode::Write).await.unwrap();
    assert!(via_path.same_as(first.write_handle()));

    let info = manager.connection_info(first.path()).await.unwrap();
    assert!(info.aliases.is_empty());
    let info = manager.connection_info("A").await.unwrap();
    assert_eq!(info.path, second.path());
}

#[tokio::test]
async fn test_read_fallback_without_read_handle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    let pair = manager
        .connect(&db_path(&dir, "plain.db"), Some("plain"), false)
        .await
        .unwrap();
    assert!(pair.read_handle().is_none());

    for _ in 0..5 {
        let handle = manager.get_connection("plain", AccessMode::Read).await.unwrap();
        assert!(handle.same_as(pair.write_handle()));
    }
}

#[tokio::test]
async fn test_read_handle_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    let pair = manager
        .connect(&db_path(&dir, "rw.db"), Some("rw"), true)
        .await
        .unwrap();
    let read = pair.read_handle().unwrap();
    assert!(!read.same_as(pair.write_handle()));

    manager
        .execute(
            "rw",
            QueryRequest::new("CREATE TABLE t (x INTEGER)").with_shape(ReturnShape::None),
        )
        .await
        .unwrap();

    let err = manager
        .execute(
            "rw",
            QueryRequest::new("INSERT INTO t VALUES (1)")
                .with_shape(ReturnShape::None)
                .with_mode(AccessMode::Read),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));

    let out = manager
        .execute(
            "rw",
            QueryRequest::new("SELECT COUNT(*) FROM t").with_mode(AccessMode::Read),
        )
        .await
        .unwrap();
    assert_eq!(out.first().and_then(|row| row[0].as_i64()), Some(0));
}

#[tokio::test]
async fn test_connect_is_idempotent_and_upgrades_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir, "same.db");
    let manager = Manager::new(ManagerConfig::default());

    let first = manager.connect(&path, None, false).await.unwrap();
    let again = manager.connect(&path, Some("same"), true).await.unwrap();
    assert!(first.write_handle().same_as(again.write_handle()));
    assert!(again.read_handle().is_some());
    assert_eq!(manager.databases().await.len(), 1);
}

#[tokio::test]
async fn test_snapshot_is_not_live() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    manager.connect(&db_path(&dir, "a.db"), None, false).await.unwrap();

    let snapshot = manager.databases().await;
    manager.connect(&db_path(&dir, "b.db"), None, false).await.unwrap();

    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.iter().count(), 1);
    // Iterating twice yields the same paths.
    let first: Vec<_> = snapshot.iter().cloned().collect();
    let second: Vec<_> = snapshot.iter().cloned().collect();
    assert_eq!(first, second);
    assert_eq!(manager.databases().await.len(), 2);
}

#[tokio::test]
async fn test_close_by_alias_removes_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    manager
        .connect(&db_path(&dir, "c.db"), Some("c"), true)
        .await
        .unwrap();

    assert!(manager.close("c").await.unwrap());
    assert!(manager.get_connection("c", AccessMode::Read).await.is_none());
    assert!(manager.databases().await.is_empty());

    let out = manager.execute("c", QueryRequest::new("SELECT 1")).await.unwrap();
    assert!(out.is_no_connection());
}

#[tokio::test]
async fn test_stale_handle_after_close() {
    let manager = Manager::new(ManagerConfig::default());
    let pair = manager.connect(":memory:", Some("mem"), true).await.unwrap();
    assert!(pair.read_handle().is_none());

    manager.close_all().await;
    let err = pair.write_handle().acquire().await.err().expect("handle is closed");
    assert!(err.is_connection_failure());
}

#[tokio::test]
async fn test_rename_path_keeps_alias() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    let pair = manager
        .connect(&db_path(&dir, "old.db"), Some("data"), false)
        .await
        .unwrap();

    let new_path = manager
        .rename_path("data", &db_path(&dir, "new.db"))
        .await
        .unwrap();
    assert_ne!(new_path, pair.path());

    let info = manager.connection_info("data").await.unwrap();
    assert_eq!(info.path, new_path);
    assert!(manager.get_connection(pair.path(), AccessMode::Write).await.is_none());

    let err = manager.rename_path("missing", "/tmp/x.db").await.unwrap_err();
    assert!(matches!(err, DbError::ConnectionNotFound { .. }));
}

#[tokio::test]
async fn test_set_alias_none_removes_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::default());
    let pair = manager
        .connect(&db_path(&dir, "d.db"), Some("d1"), false)
        .await
        .unwrap();
    manager.set_alias(pair.path(), Some("d2")).await.unwrap();
    assert_eq!(manager.connection_info("d1").await.unwrap().aliases, vec!["d1", "d2"]);

    manager.set_alias("d2", None).await.unwrap();
    assert!(manager.connection_info("d1").await.is_none());
    assert!(manager.connection_info(pair.path()).await.unwrap().aliases.is_empty());
}

#[tokio::test]
async fn test_open_failure_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no_such_dir").join("x.db");
    let manager = Manager::new(ManagerConfig::default());

    let err = manager
        .connect(missing.to_str().unwrap(), None, false)
        .await
        .unwrap_err();
    assert!(err.is_connection_failure());
    assert!(manager.databases().await.is_empty());
}
