//! Asset record repository trait.

use crate::error::MetadataResult;
use crate::models::{AssetRecordFilter, AssetRecordRow, NewAssetRecord, StoredAsset};
use async_trait::async_trait;
use locker_core::AssetTable;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for rows that may reference a blob.
///
/// Every method is a single-row atomic statement; none of them touch blobs.
#[async_trait]
pub trait AssetRecordRepo: Send + Sync {
    /// Insert a record and return it with its assigned id.
    async fn insert_asset_record(
        &self,
        table: AssetTable,
        record: &NewAssetRecord,
    ) -> MetadataResult<AssetRecordRow>;

    /// Get a record by id.
    async fn get_asset_record(
        &self,
        table: AssetTable,
        id: Uuid,
    ) -> MetadataResult<Option<AssetRecordRow>>;

    /// List records matching `filter`.
    async fn list_asset_records(
        &self,
        table: AssetTable,
        filter: &AssetRecordFilter,
    ) -> MetadataResult<Vec<AssetRecordRow>>;

    /// Replace a record's resource fields. `NotFound` if the row is gone.
    async fn update_asset_fields(
        &self,
        table: AssetTable,
        id: Uuid,
        fields: &Value,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<AssetRecordRow>;

    /// Compare-and-swap the asset columns.
    ///
    /// The row is updated only if its current `asset_key` equals `expected`
    /// (both `NULL` counts as equal). Returns `Ok(None)` when the row exists but
    /// holds a different key, and `NotFound` when the row does not exist.
    async fn swap_asset(
        &self,
        table: AssetTable,
        id: Uuid,
        expected: Option<&str>,
        new: Option<&StoredAsset>,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<AssetRecordRow>>;

    /// Delete a record, returning the row as it was at deletion time.
    async fn delete_asset_record(
        &self,
        table: AssetTable,
        id: Uuid,
    ) -> MetadataResult<AssetRecordRow>;

    /// Whether any row of `table` references `asset_key`.
    async fn asset_key_referenced(&self, table: AssetTable, asset_key: &str)
    -> MetadataResult<bool>;
}
