//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of object keys for streaming list operations.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// Blob store holding asset bytes under caller-chosen keys.
///
/// Keys are relative, `/`-separated paths. Every operation on a missing
/// object reports [`StorageError::NotFound`](crate::StorageError::NotFound)
/// distinctly from transport failures.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Whether a blob is stored under `key`.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size, modification time and content type of a blob, without its bytes.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole blob into memory.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read a blob incrementally.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Store `data` under `key`. Readers see either the old blob or the new one.
    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()>;

    /// Remove a blob. `NotFound` when nothing is stored under `key`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Keys starting with `prefix`, yielded as they are fetched.
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream>;

    /// Short backend name for logs (`"s3"`, `"filesystem"`).
    fn backend_name(&self) -> &'static str;

    /// Probe the backend. Local backends have nothing to probe.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// What the store knows about a blob besides its bytes.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Size in bytes.
    pub size: u64,
    /// Last write time; the sweeper skips blobs without one.
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type, for backends that keep it.
    pub content_type: Option<String>,
}
