//! Consistency layer between the blob store and the metadata store.
//!
//! - [`AssetLifecycleManager`]: create, replace and delete records that own a blob
//! - [`KeyGuard`]: at most one keyed record per `(parent, subject)` pair
//! - [`StaleBlobSweeper`]: removes blobs nothing references any more

pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod metrics;
pub mod sweep;
mod task;

pub use error::{AssetError, Compensation, FailureReason, StaleBlobWarning, SweepError};
pub use guard::{Disposition, KeyGuard, Upserted};
pub use lifecycle::{AssetLifecycleManager, AssetRecord, AssetRef, BlobUpload, Committed};
pub use sweep::{StaleBlobSweeper, SweepStats};
