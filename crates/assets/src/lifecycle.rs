//! Asset lifecycle manager.
//!
//! Keeps a blob in the object store and the metadata row referencing it in
//! agreement without a shared transaction. Every operation orders its store
//! calls so that a failure part-way leaves, at worst, an unreferenced blob:
//!
//! - create: write blob, insert row, delete the blob again if the insert fails
//! - replace: write new blob, swap the key, then delete the previous blob
//! - delete: delete the row, then the blob it referenced at deletion time
//!
//! Unreferenced blobs that could not be deleted are reported as
//! [`StaleBlobWarning`]s and collected later by the
//! [`StaleBlobSweeper`](crate::StaleBlobSweeper).

use crate::error::{AssetError, Compensation, StaleBlobWarning};
use crate::metrics;
use crate::task::run_detached;
use bytes::Bytes;
use locker_core::{AssetKey, AssetTable, AssetUrls};
use locker_metadata::models::{AssetRecordFilter, AssetRecordRow, NewAssetRecord, StoredAsset};
use locker_metadata::repos::AssetRecordRepo;
use locker_metadata::{MetadataError, MetadataStore};
use locker_storage::{ByteStream, ObjectStore, StorageError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Attempts at the conditional key swap before giving up on a record whose
/// key keeps changing underneath us.
pub const MAX_SWAP_ATTEMPTS: usize = 3;

/// Binary content supplied by a caller.
#[derive(Clone, Debug)]
pub struct BlobUpload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// Original file name; only its sanitized last component ends up in the key.
    pub file_name: String,
}

impl BlobUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            file_name: file_name.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// The asset attached to a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetRef {
    pub key: AssetKey,
    /// Public URL, projected from `key`.
    pub url: String,
    pub content_type: Option<String>,
    pub size: u64,
}

/// A metadata row of an asset table, as returned to callers.
#[derive(Clone, Debug)]
pub struct AssetRecord {
    pub table: AssetTable,
    pub id: Uuid,
    pub fields: Value,
    pub asset: Option<AssetRef>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AssetRecord {
    pub fn asset_key(&self) -> Option<&AssetKey> {
        self.asset.as_ref().map(|asset| &asset.key)
    }

    pub fn asset_url(&self) -> Option<&str> {
        self.asset.as_ref().map(|asset| asset.url.as_str())
    }
}

/// Result of a committed operation.
#[derive(Debug)]
pub struct Committed<T> {
    pub record: T,
    /// Set when a blob the operation unreferenced could not be deleted.
    pub warning: Option<StaleBlobWarning>,
}

impl<T> Committed<T> {
    fn clean(record: T) -> Self {
        Self {
            record,
            warning: None,
        }
    }
}

/// A key swap the metadata store has committed.
///
/// Only obtainable from a successful conditional swap, so the previous blob
/// can only be deleted once nothing references it.
#[derive(Debug)]
struct CommittedSwap {
    table: AssetTable,
    row: AssetRecordRow,
    previous: Option<String>,
}

struct Inner {
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    urls: AssetUrls,
}

/// Orchestrates blob and metadata writes for asset tables.
///
/// Cheap to clone. Mutating operations run on detached tasks.
#[derive(Clone)]
pub struct AssetLifecycleManager {
    inner: Arc<Inner>,
}

impl AssetLifecycleManager {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        urls: AssetUrls,
    ) -> Self {
        metrics::register_metrics();
        Self {
            inner: Arc::new(Inner {
                storage,
                metadata,
                urls,
            }),
        }
    }

    /// Create a record, optionally with an asset.
    ///
    /// With an upload, the blob is written first under a fresh key and the
    /// row inserted afterwards. If the insert fails the blob is deleted again
    /// and the outcome is reported in the error's [`Compensation`].
    #[instrument(skip(self, fields, upload), fields(table = %table))]
    pub async fn create_with_asset(
        &self,
        table: AssetTable,
        fields: Value,
        upload: Option<BlobUpload>,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        self.detached("create", move |inner| async move {
            inner.create(table, fields, upload).await
        })
        .await
    }

    /// Replace the asset of `record` with `upload`.
    ///
    /// The previous blob is deleted only after the row stops referencing it;
    /// failing that yields a warning, not an error.
    #[instrument(skip(self, record, upload), fields(table = %record.table, record_id = %record.id))]
    pub async fn replace_asset(
        &self,
        record: &AssetRecord,
        upload: BlobUpload,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let (table, id) = (record.table, record.id);
        let expected = record.asset_key().map(|key| key.to_string());
        self.detached("replace", move |inner| async move {
            inner.replace(table, id, expected, upload).await
        })
        .await
    }

    /// Remove the asset of `record` but keep the row.
    #[instrument(skip(self, record), fields(table = %record.table, record_id = %record.id))]
    pub async fn detach_asset(
        &self,
        record: &AssetRecord,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let (table, id) = (record.table, record.id);
        let expected = record.asset_key().map(|key| key.to_string());
        self.detached("detach", move |inner| async move {
            inner.detach(table, id, expected).await
        })
        .await
    }

    /// Delete `record` and then the blob it referenced at deletion time.
    ///
    /// Returns the record as it was deleted.
    #[instrument(skip(self, record), fields(table = %record.table, record_id = %record.id))]
    pub async fn delete_with_asset(
        &self,
        record: &AssetRecord,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let (table, id) = (record.table, record.id);
        self.detached("delete", move |inner| async move {
            inner.delete(table, id).await
        })
        .await
    }

    /// Replace the resource fields of a record, leaving its asset untouched.
    #[instrument(skip(self, fields), fields(table = %table, record_id = %id))]
    pub async fn update_fields(
        &self,
        table: AssetTable,
        id: Uuid,
        fields: Value,
    ) -> Result<AssetRecord, AssetError> {
        let row = self
            .inner
            .metadata
            .update_asset_fields(table, id, &fields, OffsetDateTime::now_utc())
            .await
            .map_err(|e| not_found_or(e, table, id, "update_fields"))?;
        self.inner.project(table, row)
    }

    /// Fetch the bytes of the asset attached to `record`.
    #[instrument(skip(self, record), fields(table = %record.table, record_id = %record.id))]
    pub async fn read_asset(&self, record: &AssetRecord) -> Result<Bytes, AssetError> {
        let asset = attached(record)?;
        self.inner
            .storage
            .get(asset.key.as_str())
            .await
            .map_err(|source| read_failure(&asset.key, source))
    }

    /// Stream the asset attached to `record` in chunks, for videos and other
    /// blobs too large to buffer.
    #[instrument(skip(self, record), fields(table = %record.table, record_id = %record.id))]
    pub async fn stream_asset(&self, record: &AssetRecord) -> Result<ByteStream, AssetError> {
        let asset = attached(record)?;
        self.inner
            .storage
            .get_stream(asset.key.as_str())
            .await
            .map_err(|source| read_failure(&asset.key, source))
    }

    /// Get a record by id.
    pub async fn get(&self, table: AssetTable, id: Uuid) -> Result<AssetRecord, AssetError> {
        let row = self
            .inner
            .metadata
            .get_asset_record(table, id)
            .await
            .map_err(|e| AssetError::metadata("get", Compensation::NotNeeded, e))?
            .ok_or_else(|| AssetError::NotFound(format!("{table} record {id}")))?;
        self.inner.project(table, row)
    }

    /// List records matching `filter`.
    pub async fn list(
        &self,
        table: AssetTable,
        filter: &AssetRecordFilter,
    ) -> Result<Vec<AssetRecord>, AssetError> {
        let rows = self
            .inner
            .metadata
            .list_asset_records(table, filter)
            .await
            .map_err(|e| AssetError::metadata("list", Compensation::NotNeeded, e))?;
        rows.into_iter()
            .map(|row| self.inner.project(table, row))
            .collect()
    }

    async fn detached<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, AssetError>
    where
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: Future<Output = Result<T, AssetError>> + Send + 'static,
        T: Send + 'static,
    {
        let operation = f(self.inner.clone());
        run_detached(op, async move {
            let result = operation.await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.reason().as_str(),
            };
            metrics::ASSET_OPERATIONS
                .with_label_values(&[op, outcome])
                .inc();
            result
        })
        .await
    }
}

impl Inner {
    async fn create(
        &self,
        table: AssetTable,
        fields: Value,
        upload: Option<BlobUpload>,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let mut new = NewAssetRecord {
            fields,
            asset: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let Some(upload) = upload else {
            let row = self
                .metadata
                .insert_asset_record(table, &new)
                .await
                .map_err(|e| AssetError::metadata("create", Compensation::NotNeeded, e))?;
            return Ok(Committed::clean(self.project(table, row)?));
        };

        let key = AssetKey::generate(table, &upload.file_name);
        new.asset = Some(self.put_blob(&key, upload).await?);

        match self.metadata.insert_asset_record(table, &new).await {
            Ok(row) => {
                tracing::debug!(record_id = %row.id, asset_key = %key, "Created record with asset");
                Ok(Committed::clean(self.project(table, row)?))
            }
            Err(source) => {
                tracing::error!(asset_key = %key, error = %source, "Failed to insert record after writing its asset");
                let compensation = self.compensate(&key).await;
                Err(AssetError::metadata("create", compensation, source))
            }
        }
    }

    async fn replace(
        &self,
        table: AssetTable,
        id: Uuid,
        expected: Option<String>,
        upload: BlobUpload,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let key = AssetKey::generate(table, &upload.file_name);
        let stored = self.put_blob(&key, upload).await?;

        match self.swap_asset_key(table, id, expected, Some(&stored)).await {
            Ok(swap) => self.retire_previous(swap).await,
            Err(source) => {
                tracing::error!(asset_key = %key, error = %source, "Failed to swap asset key, old asset kept");
                let compensation = self.compensate(&key).await;
                Err(match source {
                    MetadataError::NotFound(_) => AssetError::Vanished {
                        what: format!("{table} record {id}"),
                        compensation,
                    },
                    other => AssetError::metadata("replace", compensation, other),
                })
            }
        }
    }

    async fn detach(
        &self,
        table: AssetTable,
        id: Uuid,
        expected: Option<String>,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let swap = self
            .swap_asset_key(table, id, expected, None)
            .await
            .map_err(|e| not_found_or(e, table, id, "detach"))?;
        self.retire_previous(swap).await
    }

    async fn delete(&self, table: AssetTable, id: Uuid) -> Result<Committed<AssetRecord>, AssetError> {
        let mut row = self
            .metadata
            .delete_asset_record(table, id)
            .await
            .map_err(|e| not_found_or(e, table, id, "delete"))?;

        // The row is gone; from here on the call succeeds.
        let mut warning = match row.asset_key.as_deref() {
            Some(key) => self.delete_unreferenced(key).await,
            None => None,
        };
        let record = match self.project(table, row.clone()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(record_id = %id, error = %e, "Deleted record held an invalid asset key");
                let key = row.asset_key.take().unwrap_or_default();
                warning.get_or_insert(StaleBlobWarning {
                    key,
                    message: e.to_string(),
                });
                self.project(table, row)?
            }
        };
        Ok(Committed { record, warning })
    }

    /// Conditionally swap the asset columns, re-reading the current key when a
    /// concurrent writer changed it.
    async fn swap_asset_key(
        &self,
        table: AssetTable,
        id: Uuid,
        mut expected: Option<String>,
        new: Option<&StoredAsset>,
    ) -> Result<CommittedSwap, MetadataError> {
        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let now = OffsetDateTime::now_utc();
            if let Some(row) = self
                .metadata
                .swap_asset(table, id, expected.as_deref(), new, now)
                .await?
            {
                return Ok(CommittedSwap {
                    table,
                    row,
                    previous: expected,
                });
            }

            let current = self
                .metadata
                .get_asset_record(table, id)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("{table} record {id}")))?;
            tracing::debug!(
                attempt,
                expected = ?expected,
                current = ?current.asset_key,
                "Asset key changed concurrently, retrying swap"
            );
            expected = current.asset_key;
        }

        Err(MetadataError::Internal(format!(
            "asset key of {table} record {id} changed concurrently {MAX_SWAP_ATTEMPTS} times"
        )))
    }

    async fn retire_previous(
        &self,
        swap: CommittedSwap,
    ) -> Result<Committed<AssetRecord>, AssetError> {
        let CommittedSwap {
            table,
            row,
            previous,
        } = swap;
        let warning = match previous {
            Some(key) => self.delete_unreferenced(&key).await,
            None => None,
        };
        Ok(Committed {
            record: self.project(table, row)?,
            warning,
        })
    }

    async fn put_blob(&self, key: &AssetKey, upload: BlobUpload) -> Result<StoredAsset, AssetError> {
        let size = upload.bytes.len();
        self.storage
            .put(key.as_str(), upload.bytes, upload.content_type.as_deref())
            .await
            .map_err(|source| {
                tracing::error!(asset_key = %key, error = %source, "Failed to write asset");
                AssetError::AssetWriteFailed {
                    key: key.to_string(),
                    source,
                }
            })?;

        Ok(StoredAsset {
            key: key.to_string(),
            content_type: upload.content_type,
            size: i64::try_from(size).unwrap_or(i64::MAX),
        })
    }

    /// Delete a blob written by a failed operation.
    async fn compensate(&self, key: &AssetKey) -> Compensation {
        let compensation = match self.storage.delete(key.as_str()).await {
            Ok(()) => Compensation::BlobDeleted,
            Err(e) if e.is_not_found() => Compensation::BlobDeleted,
            Err(e) => {
                tracing::warn!(
                    asset_key = %key,
                    error = %e,
                    "Failed to delete asset after metadata failure (orphaned blob left for sweeper)"
                );
                Compensation::BlobLeaked
            }
        };
        metrics::COMPENSATING_DELETES
            .with_label_values(&[compensation.as_str()])
            .inc();
        compensation
    }

    /// Delete a blob no row references any more.
    async fn delete_unreferenced(&self, key: &str) -> Option<StaleBlobWarning> {
        match self.storage.delete(key).await {
            Ok(()) => None,
            Err(e) if e.is_not_found() => {
                tracing::debug!(asset_key = %key, "Unreferenced asset already missing from storage");
                None
            }
            Err(e) => {
                tracing::warn!(
                    asset_key = %key,
                    error = %e,
                    "Failed to delete unreferenced asset (metadata already committed)"
                );
                metrics::STALE_BLOB_WARNINGS.inc();
                Some(StaleBlobWarning {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn project(&self, table: AssetTable, row: AssetRecordRow) -> Result<AssetRecord, AssetError> {
        let asset = match row.asset_key {
            Some(key) => {
                let key = AssetKey::new(key).map_err(|e| {
                    AssetError::Internal(format!("{table} record {} holds {e}", row.id))
                })?;
                Some(AssetRef {
                    url: self.urls.url_for(&key),
                    key,
                    content_type: row.asset_content_type,
                    size: row
                        .asset_size
                        .and_then(|size| u64::try_from(size).ok())
                        .unwrap_or(0),
                })
            }
            None => None,
        };

        Ok(AssetRecord {
            table,
            id: row.id,
            fields: row.fields.0,
            asset,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn attached(record: &AssetRecord) -> Result<&AssetRef, AssetError> {
    record.asset.as_ref().ok_or_else(|| {
        AssetError::NotFound(format!("{} record {} has no asset", record.table, record.id))
    })
}

fn read_failure(key: &AssetKey, source: StorageError) -> AssetError {
    if source.is_not_found() {
        AssetError::NotFound(format!("asset {key}"))
    } else {
        AssetError::AssetReadFailed {
            key: key.to_string(),
            source,
        }
    }
}

fn not_found_or(err: MetadataError, table: AssetTable, id: Uuid, op: &'static str) -> AssetError {
    match err {
        MetadataError::NotFound(_) => AssetError::NotFound(format!("{table} record {id}")),
        other => AssetError::metadata(op, Compensation::NotNeeded, other),
    }
}
