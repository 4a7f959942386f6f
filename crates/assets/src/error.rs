//! Error taxonomy for asset and keyed-record operations.

use locker_core::KeyedTable;
use locker_metadata::MetadataError;
use locker_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Coarse failure class reported to the API layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    AssetWriteFailed,
    MetadataWriteFailed,
    DuplicateKeyViolation,
    NotFound,
    Internal,
}

impl FailureReason {
    /// Stable label, also used as a metrics label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetWriteFailed => "asset_write_failed",
            Self::MetadataWriteFailed => "metadata_write_failed",
            Self::DuplicateKeyViolation => "duplicate_key_violation",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a freshly written blob after the metadata write failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compensation {
    /// No blob was written by the operation.
    NotNeeded,
    /// The blob was removed again.
    BlobDeleted,
    /// The blob could not be removed and is left for the sweeper.
    BlobLeaked,
}

impl Compensation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotNeeded => "not_needed",
            Self::BlobDeleted => "blob_deleted",
            Self::BlobLeaked => "blob_leaked",
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an asset lifecycle or key guard operation.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to write asset {key}: {source}")]
    AssetWriteFailed {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("metadata write failed during {op} (compensation: {compensation}): {source}")]
    MetadataWriteFailed {
        op: &'static str,
        compensation: Compensation,
        #[source]
        source: MetadataError,
    },

    #[error(
        "{count} {table} records exist for ({parent_key}, {subject_key}), expected at most one"
    )]
    DuplicateKeyViolation {
        table: KeyedTable,
        parent_key: String,
        subject_key: String,
        count: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// The record disappeared after a blob had already been written for it.
    #[error("not found: {what} (compensation: {compensation})")]
    Vanished {
        what: String,
        compensation: Compensation,
    },

    #[error("failed to read asset {key}: {source}")]
    AssetReadFailed {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AssetError {
    /// Failure class of this error.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::AssetWriteFailed { .. } => FailureReason::AssetWriteFailed,
            Self::MetadataWriteFailed { .. } => FailureReason::MetadataWriteFailed,
            Self::DuplicateKeyViolation { .. } => FailureReason::DuplicateKeyViolation,
            Self::NotFound(_) | Self::Vanished { .. } => FailureReason::NotFound,
            Self::AssetReadFailed { .. } | Self::Internal(_) => FailureReason::Internal,
        }
    }

    /// Compensation outcome, for failures after a blob was written.
    pub fn compensation(&self) -> Option<Compensation> {
        match self {
            Self::MetadataWriteFailed { compensation, .. } | Self::Vanished { compensation, .. } => {
                Some(*compensation)
            }
            _ => None,
        }
    }

    pub(crate) fn metadata(
        op: &'static str,
        compensation: Compensation,
        source: MetadataError,
    ) -> Self {
        Self::MetadataWriteFailed {
            op,
            compensation,
            source,
        }
    }
}

/// Non-fatal report that a no-longer-referenced blob could not be deleted.
///
/// The owning operation committed; the blob is left for the sweeper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleBlobWarning {
    pub key: String,
    pub message: String,
}

impl fmt::Display for StaleBlobWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale blob {}: {}", self.key, self.message)
    }
}

/// Errors that abort a sweep run.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
