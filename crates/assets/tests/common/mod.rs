//! Test stores with fault injection and an ordered call journal.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use locker_assets::AssetLifecycleManager;
use locker_core::{AssetTable, AssetUrls, KeyedTable};
use locker_metadata::models::{
    AssetRecordFilter, AssetRecordRow, KeyedRecordRow, NewAssetRecord, NewKeyedRecord,
    StoredAsset,
};
use locker_metadata::repos::{AssetRecordRepo, KeyedRecordRepo};
use locker_metadata::{MetadataError, MetadataResult, MetadataStore, SqliteStore};
use locker_storage::{
    FilesystemBackend, KeyStream, ObjectMeta, ObjectStore, StorageError, StorageResult,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

pub const PUBLIC_BASE_URL: &str = "https://cdn.example.test/locker";

/// Ordered record of store calls that changed state.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
}

fn injected_db(what: &str) -> MetadataError {
    MetadataError::Internal(format!("injected {what} failure"))
}

/// Blob store wrapper whose writes and deletes can be made to fail.
pub struct FlakyStorage {
    inner: Arc<dyn ObjectStore>,
    journal: Journal,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn ObjectStore>, journal: Journal) -> Self {
        Self {
            inner,
            journal,
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStorage {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<locker_storage::ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(injected("put"));
        }
        self.inner.put(key, data, content_type).await?;
        self.journal.push(format!("blob.put {key}"));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete(key).await?;
        self.journal.push(format!("blob.delete {key}"));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        self.inner.list_stream(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Metadata store wrapper with failure switches and race hooks.
pub struct FlakyMetadata {
    inner: Arc<dyn MetadataStore>,
    journal: Journal,
    pub fail_insert: AtomicBool,
    pub fail_swap: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Asset swapped in by a simulated concurrent writer right before the
    /// next `swap_asset` call.
    pub interfering_swap: Mutex<Option<StoredAsset>>,
    /// Keyed record inserted by a simulated concurrent caller right before
    /// the next `insert_keyed_record` call.
    pub racing_insert: Mutex<Option<NewKeyedRecord>>,
}

impl FlakyMetadata {
    pub fn new(inner: Arc<dyn MetadataStore>, journal: Journal) -> Self {
        Self {
            inner,
            journal,
            fail_insert: AtomicBool::new(false),
            fail_swap: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            interfering_swap: Mutex::new(None),
            racing_insert: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> Arc<dyn MetadataStore> {
        self.inner.clone()
    }
}

#[async_trait]
impl AssetRecordRepo for FlakyMetadata {
    async fn insert_asset_record(
        &self,
        table: AssetTable,
        record: &NewAssetRecord,
    ) -> MetadataResult<AssetRecordRow> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(injected_db("insert"));
        }
        let row = self.inner.insert_asset_record(table, record).await?;
        self.journal.push(format!("row.insert {}", row.id));
        Ok(row)
    }

    async fn get_asset_record(
        &self,
        table: AssetTable,
        id: Uuid,
    ) -> MetadataResult<Option<AssetRecordRow>> {
        self.inner.get_asset_record(table, id).await
    }

    async fn list_asset_records(
        &self,
        table: AssetTable,
        filter: &AssetRecordFilter,
    ) -> MetadataResult<Vec<AssetRecordRow>> {
        self.inner.list_asset_records(table, filter).await
    }

    async fn update_asset_fields(
        &self,
        table: AssetTable,
        id: Uuid,
        fields: &Value,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<AssetRecordRow> {
        self.inner
            .update_asset_fields(table, id, fields, updated_at)
            .await
    }

    async fn swap_asset(
        &self,
        table: AssetTable,
        id: Uuid,
        expected: Option<&str>,
        new: Option<&StoredAsset>,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<AssetRecordRow>> {
        if self.fail_swap.load(Ordering::SeqCst) {
            return Err(injected_db("swap"));
        }

        let interference = self.interfering_swap.lock().unwrap().take();
        if let Some(other) = interference
            && let Some(current) = self.inner.get_asset_record(table, id).await?
        {
            self.inner
                .swap_asset(
                    table,
                    id,
                    current.asset_key.as_deref(),
                    Some(&other),
                    updated_at,
                )
                .await?;
            self.journal.push(format!("row.swap {id} {}", other.key));
        }

        let swapped = self
            .inner
            .swap_asset(table, id, expected, new, updated_at)
            .await?;
        if swapped.is_some() {
            let key = new.map(|asset| asset.key.as_str()).unwrap_or("NULL");
            self.journal.push(format!("row.swap {id} {key}"));
        }
        Ok(swapped)
    }

    async fn delete_asset_record(
        &self,
        table: AssetTable,
        id: Uuid,
    ) -> MetadataResult<AssetRecordRow> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected_db("delete"));
        }
        let row = self.inner.delete_asset_record(table, id).await?;
        self.journal.push(format!("row.delete {id}"));
        Ok(row)
    }

    async fn asset_key_referenced(
        &self,
        table: AssetTable,
        asset_key: &str,
    ) -> MetadataResult<bool> {
        self.inner.asset_key_referenced(table, asset_key).await
    }
}

#[async_trait]
impl KeyedRecordRepo for FlakyMetadata {
    async fn insert_keyed_record(
        &self,
        table: KeyedTable,
        record: &NewKeyedRecord,
    ) -> MetadataResult<KeyedRecordRow> {
        let racing = self.racing_insert.lock().unwrap().take();
        if let Some(racing) = racing {
            self.inner.insert_keyed_record(table, &racing).await?;
            self.journal.push("keyed.insert racing");
        }
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(injected_db("insert"));
        }
        let row = self.inner.insert_keyed_record(table, record).await?;
        self.journal.push(format!("keyed.insert {}", row.id));
        Ok(row)
    }

    async fn get_keyed_record(
        &self,
        table: KeyedTable,
        id: Uuid,
    ) -> MetadataResult<Option<KeyedRecordRow>> {
        self.inner.get_keyed_record(table, id).await
    }

    async fn find_keyed_records(
        &self,
        table: KeyedTable,
        parent_key: &str,
        subject_key: &str,
    ) -> MetadataResult<Vec<KeyedRecordRow>> {
        self.inner
            .find_keyed_records(table, parent_key, subject_key)
            .await
    }

    async fn list_keyed_records(
        &self,
        table: KeyedTable,
        parent_key: &str,
    ) -> MetadataResult<Vec<KeyedRecordRow>> {
        self.inner.list_keyed_records(table, parent_key).await
    }

    async fn update_keyed_fields(
        &self,
        table: KeyedTable,
        id: Uuid,
        fields: &Value,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<KeyedRecordRow> {
        let row = self
            .inner
            .update_keyed_fields(table, id, fields, updated_at)
            .await?;
        self.journal.push(format!("keyed.update {id}"));
        Ok(row)
    }

    async fn delete_keyed_record(&self, table: KeyedTable, id: Uuid) -> MetadataResult<()> {
        self.inner.delete_keyed_record(table, id).await?;
        self.journal.push(format!("keyed.delete {id}"));
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }

    fn enforces_unique_keys(&self) -> bool {
        self.inner.enforces_unique_keys()
    }
}

/// Filesystem blobs and SQLite metadata in a temporary directory.
pub struct TestEnv {
    pub storage: Arc<FlakyStorage>,
    pub metadata: Arc<FlakyMetadata>,
    pub journal: Journal,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new(unique_keyed_records: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path().join("blobs"))
            .await
            .expect("Failed to create filesystem backend");
        let store = SqliteStore::new(temp_dir.path().join("metadata.db"), unique_keyed_records)
            .await
            .expect("Failed to create SQLite store");

        let journal = Journal::default();
        Self {
            storage: Arc::new(FlakyStorage::new(Arc::new(backend), journal.clone())),
            metadata: Arc::new(FlakyMetadata::new(Arc::new(store), journal.clone())),
            journal,
            _temp_dir: temp_dir,
        }
    }

    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.storage.clone()
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.metadata.clone()
    }

    pub fn manager(&self) -> AssetLifecycleManager {
        AssetLifecycleManager::new(
            self.storage(),
            self.metadata(),
            AssetUrls::new(PUBLIC_BASE_URL),
        )
    }

    /// Whether a blob exists, bypassing failure injection.
    pub async fn blob_exists(&self, key: &str) -> bool {
        self.storage.inner.exists(key).await.unwrap()
    }
}
