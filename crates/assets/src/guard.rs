//! Idempotent key guard.
//!
//! Keeps at most one row per `(parent, subject)` pair in a keyed table
//! without requiring the database to enforce uniqueness. An upsert looks the
//! pair up, then inserts or updates. After an insert it re-reads the pair: if
//! a concurrent caller inserted too, the row with the lowest sequence number
//! wins and the other caller folds its write into it.
//!
//! With `unique_keyed_records` enabled the store rejects the second insert
//! with `AlreadyExists`, which the guard turns into an update.

use crate::error::{AssetError, Compensation};
use crate::metrics;
use crate::task::run_detached;
use locker_core::KeyedTable;
use locker_metadata::models::{KeyedRecordRow, NewKeyedRecord};
use locker_metadata::repos::KeyedRecordRepo;
use locker_metadata::{MetadataError, MetadataStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;

/// Re-reads of a pair that showed more than one row before it is reported
/// as a duplicate. Covers a concurrent upsert that is still settling.
const DUPLICATE_RECHECKS: usize = 3;
const DUPLICATE_RECHECK_DELAY: Duration = Duration::from_millis(25);

/// Whether an upsert created a row or updated an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Created,
    Updated,
}

/// Result of [`KeyGuard::upsert_by_key`].
#[derive(Clone, Debug)]
pub struct Upserted {
    pub record: KeyedRecordRow,
    pub disposition: Disposition,
}

/// Upserts keyed records by their `(parent, subject)` pair.
#[derive(Clone)]
pub struct KeyGuard {
    metadata: Arc<dyn MetadataStore>,
}

impl KeyGuard {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        metrics::register_metrics();
        Self { metadata }
    }

    /// Insert or update the record for `(parent_key, subject_key)`.
    ///
    /// An existing record keeps its `id`, `created_at` and key columns; only
    /// `fields` and `updated_at` change. More than one existing record is
    /// reported as [`AssetError::DuplicateKeyViolation`] and left untouched.
    #[instrument(skip(self, fields), fields(table = %table))]
    pub async fn upsert_by_key(
        &self,
        table: KeyedTable,
        parent_key: &str,
        subject_key: &str,
        fields: Value,
    ) -> Result<Upserted, AssetError> {
        let upsert = Upsert {
            metadata: self.metadata.clone(),
            table,
            parent_key: parent_key.to_string(),
            subject_key: subject_key.to_string(),
            fields,
        };

        run_detached("upsert", async move {
            let result = upsert.run().await;
            let outcome = match &result {
                Ok(upserted) => match upserted.disposition {
                    Disposition::Created => "created",
                    Disposition::Updated => "updated",
                },
                Err(e) => e.reason().as_str(),
            };
            metrics::KEY_GUARD_OUTCOMES
                .with_label_values(&[outcome])
                .inc();
            result
        })
        .await
    }
}

struct Upsert {
    metadata: Arc<dyn MetadataStore>,
    table: KeyedTable,
    parent_key: String,
    subject_key: String,
    fields: Value,
}

impl Upsert {
    async fn run(&self) -> Result<Upserted, AssetError> {
        if let Some(existing) = self.lookup().await? {
            return self.update(existing).await;
        }

        let new = NewKeyedRecord {
            parent_key: self.parent_key.clone(),
            subject_key: self.subject_key.clone(),
            fields: self.fields.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        match self.metadata.insert_keyed_record(self.table, &new).await {
            Ok(row) => self.settle(row).await,
            Err(insert_err) => {
                tracing::debug!(
                    parent_key = %self.parent_key,
                    subject_key = %self.subject_key,
                    error = %insert_err,
                    "Keyed insert failed, looking the pair up again"
                );
                match self.lookup().await? {
                    Some(existing) => self.update(existing).await,
                    None => Err(AssetError::metadata(
                        "upsert_insert",
                        Compensation::NotNeeded,
                        insert_err,
                    )),
                }
            }
        }
    }

    /// The single row holding the pair, if any.
    async fn lookup(&self) -> Result<Option<KeyedRecordRow>, AssetError> {
        let mut attempt = 0;
        loop {
            let mut rows = self.find().await?;
            if rows.len() <= 1 {
                return Ok(rows.pop());
            }

            attempt += 1;
            if attempt > DUPLICATE_RECHECKS {
                tracing::error!(
                    parent_key = %self.parent_key,
                    subject_key = %self.subject_key,
                    count = rows.len(),
                    "Duplicate keyed records"
                );
                return Err(AssetError::DuplicateKeyViolation {
                    table: self.table,
                    parent_key: self.parent_key.clone(),
                    subject_key: self.subject_key.clone(),
                    count: rows.len(),
                });
            }
            tokio::time::sleep(DUPLICATE_RECHECK_DELAY).await;
        }
    }

    async fn find(&self) -> Result<Vec<KeyedRecordRow>, AssetError> {
        self.metadata
            .find_keyed_records(self.table, &self.parent_key, &self.subject_key)
            .await
            .map_err(|e| AssetError::metadata("upsert_lookup", Compensation::NotNeeded, e))
    }

    async fn update(&self, existing: KeyedRecordRow) -> Result<Upserted, AssetError> {
        let record = self
            .metadata
            .update_keyed_fields(
                self.table,
                existing.id,
                &self.fields,
                OffsetDateTime::now_utc(),
            )
            .await
            .map_err(|e| match e {
                MetadataError::NotFound(_) => {
                    AssetError::NotFound(format!("{} record {}", self.table, existing.id))
                }
                other => AssetError::metadata("upsert_update", Compensation::NotNeeded, other),
            })?;

        Ok(Upserted {
            record,
            disposition: Disposition::Updated,
        })
    }

    /// Resolve a race with concurrent inserts of the same pair.
    async fn settle(&self, own: KeyedRecordRow) -> Result<Upserted, AssetError> {
        let rows = match self.find().await {
            Ok(rows) => rows,
            Err(e) => {
                // Our insert committed; the next upsert will see any duplicate.
                tracing::warn!(record_id = %own.id, error = %e, "Failed to re-read keyed record after insert");
                return Ok(created(own));
            }
        };

        let canonical = match rows.into_iter().min_by_key(|row| row.seq) {
            Some(row) if row.id != own.id => row,
            _ => return Ok(created(own)),
        };

        tracing::info!(
            own_id = %own.id,
            canonical_id = %canonical.id,
            "Concurrent insert of the same key, folding into the earlier record"
        );
        match self.metadata.delete_keyed_record(self.table, own.id).await {
            Ok(()) | Err(MetadataError::NotFound(_)) => {}
            Err(e) => {
                return Err(AssetError::metadata(
                    "upsert_settle",
                    Compensation::NotNeeded,
                    e,
                ));
            }
        }
        self.update(canonical).await
    }
}

fn created(record: KeyedRecordRow) -> Upserted {
    Upserted {
        record,
        disposition: Disposition::Created,
    }
}
