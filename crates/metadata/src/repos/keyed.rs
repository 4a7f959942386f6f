//! Keyed record repository trait.

use crate::error::MetadataResult;
use crate::models::{KeyedRecordRow, NewKeyedRecord};
use async_trait::async_trait;
use locker_core::KeyedTable;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for rows identified by a `(parent, subject)` pair.
///
/// Results of multi-row lookups are ordered by insertion sequence.
#[async_trait]
pub trait KeyedRecordRepo: Send + Sync {
    /// Insert a record. `AlreadyExists` when a unique index rejects it.
    async fn insert_keyed_record(
        &self,
        table: KeyedTable,
        record: &NewKeyedRecord,
    ) -> MetadataResult<KeyedRecordRow>;

    /// Get a record by id.
    async fn get_keyed_record(
        &self,
        table: KeyedTable,
        id: Uuid,
    ) -> MetadataResult<Option<KeyedRecordRow>>;

    /// All records holding the pair.
    async fn find_keyed_records(
        &self,
        table: KeyedTable,
        parent_key: &str,
        subject_key: &str,
    ) -> MetadataResult<Vec<KeyedRecordRow>>;

    /// All records under a parent.
    async fn list_keyed_records(
        &self,
        table: KeyedTable,
        parent_key: &str,
    ) -> MetadataResult<Vec<KeyedRecordRow>>;

    /// Replace a record's fields. `NotFound` if the row is gone.
    async fn update_keyed_fields(
        &self,
        table: KeyedTable,
        id: Uuid,
        fields: &Value,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<KeyedRecordRow>;

    /// Delete a record. `NotFound` if the row is gone.
    async fn delete_keyed_record(&self, table: KeyedTable, id: Uuid) -> MetadataResult<()>;
}
