//! Stale blob sweeper tests.

mod common;

use bytes::Bytes;
use common::TestEnv;
use locker_assets::{BlobUpload, StaleBlobSweeper, SweepError};
use locker_core::AssetTable;
use locker_core::config::SweepConfig;
use locker_storage::ObjectStore;
use serde_json::json;
use std::time::Duration;

fn config(grace_period_secs: u64, dry_run: bool) -> SweepConfig {
    SweepConfig {
        grace_period_secs,
        dry_run,
        ..Default::default()
    }
}

/// One referenced photo and two orphaned blobs in different namespaces.
async fn seed(env: &TestEnv) -> String {
    let record = env
        .manager()
        .create_with_asset(
            AssetTable::Athletes,
            json!({}),
            Some(BlobUpload::new("photo.jpg", vec![1u8; 32])),
        )
        .await
        .unwrap()
        .record;

    let storage = env.storage();
    storage
        .put("athletes/photos/1-orphan.jpg", Bytes::from_static(b"orphan"), None)
        .await
        .unwrap();
    storage
        .put("library/videos/1-orphan.mp4", Bytes::from_static(b"video"), None)
        .await
        .unwrap();

    // Let the blobs age past a zero grace period.
    tokio::time::sleep(Duration::from_millis(20)).await;
    record.asset_key().unwrap().to_string()
}

#[tokio::test]
async fn test_sweep_deletes_only_unreferenced_blobs() {
    let env = TestEnv::new(false).await;
    let referenced = seed(&env).await;

    let sweeper = StaleBlobSweeper::new(env.storage(), env.metadata(), config(0, false)).unwrap();
    let stats = sweeper.sweep().await.unwrap();

    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.referenced, 1);
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.bytes_reclaimed, 11);
    assert_eq!(stats.errors, 0);
    assert!(!stats.truncated);

    assert!(env.blob_exists(&referenced).await);
    assert!(!env.blob_exists("athletes/photos/1-orphan.jpg").await);
    assert!(!env.blob_exists("library/videos/1-orphan.mp4").await);
}

#[tokio::test]
async fn test_sweep_respects_grace_period() {
    let env = TestEnv::new(false).await;
    seed(&env).await;

    let sweeper =
        StaleBlobSweeper::new(env.storage(), env.metadata(), config(3600, false)).unwrap();
    let stats = sweeper.sweep().await.unwrap();

    assert_eq!(stats.too_recent, 2);
    assert_eq!(stats.deleted, 0);
    assert!(env.blob_exists("athletes/photos/1-orphan.jpg").await);
}

#[tokio::test]
async fn test_dry_run_deletes_nothing() {
    let env = TestEnv::new(false).await;
    seed(&env).await;

    let sweeper = StaleBlobSweeper::new(env.storage(), env.metadata(), config(0, true)).unwrap();
    let stats = sweeper.sweep().await.unwrap();

    assert_eq!(stats.would_delete, 2);
    assert_eq!(stats.deleted, 0);
    assert!(env.blob_exists("athletes/photos/1-orphan.jpg").await);
    assert!(env.blob_exists("library/videos/1-orphan.mp4").await);
    assert!(env.journal.position("blob.delete").is_none());
}

#[tokio::test]
async fn test_sweep_stops_at_max_objects() {
    let env = TestEnv::new(false).await;
    seed(&env).await;

    let sweeper = StaleBlobSweeper::new(
        env.storage(),
        env.metadata(),
        SweepConfig {
            grace_period_secs: 0,
            dry_run: true,
            max_objects: 1,
        },
    )
    .unwrap();
    let stats = sweeper.sweep().await.unwrap();

    assert_eq!(stats.scanned, 1);
    assert!(stats.truncated);
}

#[tokio::test]
async fn test_sweep_counts_delete_failures() {
    let env = TestEnv::new(false).await;
    seed(&env).await;
    env.storage
        .fail_delete
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let sweeper = StaleBlobSweeper::new(env.storage(), env.metadata(), config(0, false)).unwrap();
    let stats = sweeper.sweep().await.unwrap();

    assert_eq!(stats.errors, 2);
    assert_eq!(stats.deleted, 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let env = TestEnv::new(false).await;
    let result = StaleBlobSweeper::new(
        env.storage(),
        env.metadata(),
        SweepConfig {
            max_objects: 0,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(SweepError::Config(_))));
}
