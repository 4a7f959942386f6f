//! Database models mapping to the metadata schema.

use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Asset records
// =============================================================================

/// A row of an asset table (`athletes`, `exercises`, ...).
#[derive(Debug, Clone, FromRow)]
pub struct AssetRecordRow {
    pub id: Uuid,
    /// Resource columns owned by the CRUD layer.
    pub fields: Json<Value>,
    /// Canonical blob key, `NULL` while the record has no asset.
    pub asset_key: Option<String>,
    pub asset_content_type: Option<String>,
    pub asset_size: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AssetRecordRow {
    /// The stored asset reference, if any.
    pub fn stored_asset(&self) -> Option<StoredAsset> {
        self.asset_key.as_ref().map(|key| StoredAsset {
            key: key.clone(),
            content_type: self.asset_content_type.clone(),
            size: self.asset_size.unwrap_or(0),
        })
    }
}

/// Asset columns written together when a blob is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub key: String,
    pub content_type: Option<String>,
    pub size: i64,
}

/// Input for inserting an asset record. The id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAssetRecord {
    pub fields: Value,
    pub asset: Option<StoredAsset>,
    pub created_at: OffsetDateTime,
}

/// Sort order for record listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordOrder {
    /// Oldest first.
    #[default]
    CreatedAsc,
    /// Newest first.
    CreatedDesc,
}

impl RecordOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::CreatedAsc => " ORDER BY created_at ASC, id ASC",
            Self::CreatedDesc => " ORDER BY created_at DESC, id DESC",
        }
    }
}

/// Equality and range filters for listing asset records.
#[derive(Debug, Clone, Default)]
pub struct AssetRecordFilter {
    /// Only records created at or after this instant.
    pub created_after: Option<OffsetDateTime>,
    /// Only records created strictly before this instant.
    pub created_before: Option<OffsetDateTime>,
    /// `Some(true)`: only records with an asset; `Some(false)`: only without.
    pub with_asset: Option<bool>,
    pub order: RecordOrder,
    pub limit: Option<u32>,
}

// =============================================================================
// Keyed records
// =============================================================================

/// A row of a keyed table, with its key columns aliased to
/// `parent_key`/`subject_key`.
#[derive(Debug, Clone, FromRow)]
pub struct KeyedRecordRow {
    /// Store-assigned insertion sequence.
    pub seq: i64,
    pub id: Uuid,
    pub parent_key: String,
    pub subject_key: String,
    pub fields: Json<Value>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Input for inserting a keyed record.
#[derive(Debug, Clone)]
pub struct NewKeyedRecord {
    pub parent_key: String,
    pub subject_key: String,
    pub fields: Value,
    pub created_at: OffsetDateTime,
}
