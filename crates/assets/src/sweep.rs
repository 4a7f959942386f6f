//! Stale blob sweeper.
//!
//! Deletes blobs that no metadata row references: compensations that failed,
//! previous assets whose deletion produced a [`StaleBlobWarning`], and blobs
//! of creates that crashed between the blob write and the insert. Blobs
//! younger than the grace period are skipped so an in-flight create is never
//! swept from under its insert.
//!
//! [`StaleBlobWarning`]: crate::StaleBlobWarning

use crate::error::SweepError;
use crate::metrics;
use futures::StreamExt;
use locker_core::AssetTable;
use locker_core::config::SweepConfig;
use locker_metadata::MetadataStore;
use locker_metadata::repos::AssetRecordRepo;
use locker_storage::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Counters of a sweep run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Blobs examined.
    pub scanned: u64,
    /// Blobs still referenced by a row.
    pub referenced: u64,
    /// Unreferenced blobs younger than the grace period.
    pub too_recent: u64,
    pub deleted: u64,
    /// Unreferenced blobs a dry run left in place.
    pub would_delete: u64,
    pub bytes_reclaimed: u64,
    /// Per-blob failures.
    pub errors: u64,
    /// Stopped at `max_objects` before listing everything.
    pub truncated: bool,
}

/// Deletes unreferenced blobs in every asset namespace.
pub struct StaleBlobSweeper {
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    config: SweepConfig,
}

impl StaleBlobSweeper {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        config: SweepConfig,
    ) -> Result<Self, SweepError> {
        config.validate().map_err(SweepError::Config)?;
        metrics::register_metrics();
        Ok(Self {
            storage,
            metadata,
            config,
        })
    }

    /// Run one sweep over all asset tables.
    ///
    /// Failures on individual blobs are counted in [`SweepStats::errors`];
    /// only a failing listing aborts the run.
    #[instrument(skip(self), fields(dry_run = self.config.dry_run))]
    pub async fn sweep(&self) -> Result<SweepStats, SweepError> {
        let cutoff = OffsetDateTime::now_utc() - self.config.grace_period();
        let mut stats = SweepStats::default();

        for table in AssetTable::ALL {
            self.sweep_table(table, cutoff, &mut stats).await?;
            if stats.truncated {
                tracing::warn!(
                    max_objects = self.config.max_objects,
                    "Sweep stopped at max_objects, remaining blobs are left for the next run"
                );
                break;
            }
        }

        tracing::info!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            would_delete = stats.would_delete,
            errors = stats.errors,
            "Sweep finished"
        );
        Ok(stats)
    }

    async fn sweep_table(
        &self,
        table: AssetTable,
        cutoff: OffsetDateTime,
        stats: &mut SweepStats,
    ) -> Result<(), SweepError> {
        let mut keys = self.storage.list_stream(&table.key_prefix()).await?;

        while let Some(key) = keys.next().await {
            let key = key?;
            if stats.scanned >= self.config.max_objects {
                stats.truncated = true;
                return Ok(());
            }
            stats.scanned += 1;

            match self.metadata.asset_key_referenced(table, &key).await {
                Ok(true) => {
                    stats.referenced += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(table = %table, asset_key = %key, error = %e, "Failed to check blob reference");
                    stats.errors += 1;
                    continue;
                }
            }

            let meta = match self.storage.head(&key).await {
                Ok(meta) => meta,
                // Deleted since it was listed.
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::warn!(asset_key = %key, error = %e, "Failed to read blob metadata");
                    stats.errors += 1;
                    continue;
                }
            };

            // Without a timestamp the blob's age is unknown; keep it.
            let old_enough = meta
                .last_modified
                .is_some_and(|modified| modified < cutoff);
            if !old_enough {
                stats.too_recent += 1;
                continue;
            }

            if self.config.dry_run {
                tracing::info!(table = %table, asset_key = %key, size = meta.size, "Would delete unreferenced blob");
                stats.would_delete += 1;
                continue;
            }

            match self.storage.delete(&key).await {
                Ok(()) => {
                    tracing::debug!(table = %table, asset_key = %key, "Deleted unreferenced blob");
                    metrics::SWEEP_BLOBS_DELETED.inc();
                    stats.deleted += 1;
                    stats.bytes_reclaimed += meta.size;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(asset_key = %key, error = %e, "Failed to delete unreferenced blob");
                    stats.errors += 1;
                }
            }
        }

        Ok(())
    }
}
