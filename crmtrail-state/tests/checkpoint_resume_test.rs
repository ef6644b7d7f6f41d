//! Watermarks written by one process are picked up by the next one.

use std::sync::Arc;
use chrono::{TimeZone, Utc};
use crmtrail_state::{Checkpoint, FileStateStore, StateStore};
use tempfile::tempdir;

#[tokio::test]
async fn test_watermark_survives_restart() {
    let dir = tempdir().unwrap();
    let watermark = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

    {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let checkpoint = Checkpoint::new("entity-delta/lastdate.txt", store);
        assert_eq!(checkpoint.read().await.unwrap(), None);
        checkpoint.advance(watermark).await.unwrap();
    }

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let checkpoint = Checkpoint::new("entity-delta/lastdate.txt", store);
    assert_eq!(checkpoint.read().await.unwrap(), Some(watermark));
}

#[tokio::test]
async fn test_legacy_watermark_is_upgraded_on_advance() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("lastdate.txt"), "1/1/2024 2:00:00 AM").unwrap();

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let checkpoint = Checkpoint::new("lastdate.txt", store.clone());

    let current = checkpoint.read().await.unwrap().unwrap();
    assert_eq!(current, Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());

    checkpoint.advance(current + chrono::Duration::hours(2)).await.unwrap();
    assert_eq!(
        store.load_raw("lastdate.txt").await.unwrap().as_deref(),
        Some("2024-01-01T04:00:00Z")
    );
}
