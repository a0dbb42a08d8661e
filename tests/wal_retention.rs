//! WAL retention and crash-recovery behavior (§4.6), exercised as an
//! integration test against a real SQLite file rather than the in-module
//! unit tests' narrower single-transition checks.

use mt5_bridge::{EntryStatus, Wal};
use tempfile::NamedTempFile;

async fn open_wal(retention_days: i64) -> (Wal, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let wal = Wal::open(file.path().to_path_buf(), retention_days).await.unwrap();
    (wal, file)
}

#[tokio::test]
async fn cleanup_never_touches_pending_or_sent_entries() {
    let (wal, _file) = open_wal(0).await;

    wal.log_intent("RQ0000000000000001", "order_send", "{}")
        .await
        .unwrap();
    wal.log_intent("RQ0000000000000002", "order_send", "{}")
        .await
        .unwrap();
    wal.mark_sent("RQ0000000000000002").await.unwrap();

    // retention_days = 0 means any terminal entry is immediately eligible,
    // but neither entry above is terminal.
    let deleted = wal.cleanup_old().await.unwrap();
    assert_eq!(deleted, 0);

    assert_eq!(
        wal.get_entry("RQ0000000000000001").await.unwrap().unwrap().status,
        EntryStatus::Pending
    );
    assert_eq!(
        wal.get_entry("RQ0000000000000002").await.unwrap().unwrap().status,
        EntryStatus::Sent
    );
}

#[tokio::test]
async fn cleanup_removes_terminal_entries_past_retention() {
    let (wal, _file) = open_wal(0).await;

    wal.log_intent("RQ0000000000000001", "order_send", "{}")
        .await
        .unwrap();
    wal.mark_sent("RQ0000000000000001").await.unwrap();
    wal.mark_verified("RQ0000000000000001", Some(10009))
        .await
        .unwrap();

    wal.log_intent("RQ0000000000000002", "order_send", "{}")
        .await
        .unwrap();
    wal.mark_sent("RQ0000000000000002").await.unwrap();
    wal.mark_failed("RQ0000000000000002", None).await.unwrap();

    let deleted = wal.cleanup_old().await.unwrap();
    assert_eq!(deleted, 2);
    assert!(wal.get_entry("RQ0000000000000001").await.unwrap().is_none());
    assert!(wal.get_entry("RQ0000000000000002").await.unwrap().is_none());
}

#[tokio::test]
async fn recovered_is_terminal_and_cleaned_up() {
    let (wal, _file) = open_wal(0).await;
    wal.log_intent("RQ0000000000000003", "order_send", "{}")
        .await
        .unwrap();
    wal.mark_sent("RQ0000000000000003").await.unwrap();
    wal.mark_recovered("RQ0000000000000003", Some(10009))
        .await
        .unwrap();

    assert_eq!(
        wal.get_entry("RQ0000000000000003").await.unwrap().unwrap().status,
        EntryStatus::Recovered
    );
    let deleted = wal.cleanup_old().await.unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn disabled_wal_is_a_pure_no_op() {
    let wal = Wal::disabled();
    wal.log_intent("RQ0000000000000001", "order_send", "{}")
        .await
        .unwrap();
    wal.mark_sent("RQ0000000000000001").await.unwrap();
    wal.mark_verified("RQ0000000000000001", Some(10009))
        .await
        .unwrap();
    assert!(wal.get_entry("RQ0000000000000001").await.unwrap().is_none());
    assert!(wal.get_incomplete().await.unwrap().is_empty());
    assert_eq!(wal.cleanup_old().await.unwrap(), 0);
}
