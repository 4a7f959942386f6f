//! Local filesystem storage backend.
//!
//! Blobs live at `{root}/{key}`. Writes go to a dot-prefixed temporary file in
//! the target directory and are renamed into place, so readers never observe a
//! partially written asset. Asset keys never contain a segment starting with
//! `.`, which lets listings skip in-flight temporaries by name.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path under the root, off the async runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Resolve a key, rejecting anything that would escape the root,
    /// including through symlinks.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!(
                "contains unsafe path component: {key}"
            )));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Check the path itself if it exists, otherwise its nearest existing ancestor.
        let mut candidate = Some(path.as_path());
        while let Some(current) = candidate {
            match std::fs::symlink_metadata(current) {
                Ok(meta) => {
                    let canonical = current.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    candidate = current.parent();
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(path)
    }

    fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }

    /// Walk `base` and collect keys of regular files, skipping temporaries and symlinks.
    async fn walk(root: &Path, base: PathBuf) -> StorageResult<Vec<String>> {
        let mut results = Vec::new();
        match fs::try_exists(&base).await {
            Ok(true) => {}
            Ok(false) => return Ok(results),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Directory removed concurrently.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(root)
                {
                    results.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        results.sort();
        Ok(results)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(Self::map_not_found(key))?;
        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            // The filesystem keeps no content type; the metadata row does.
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(Self::map_not_found(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(Self::map_not_found(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _content_type: Option<&str>) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(Self::map_not_found(key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let (base, filter) = self.listing_base(prefix).await?;
        let keys = Self::walk(&self.root, base).await?;
        Ok(keys.into_iter().filter(|k| k.starts_with(&filter)).collect())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let keys = self.list(prefix).await?;
        let stream = async_stream::stream! {
            for key in keys {
                yield Ok(key);
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

impl FilesystemBackend {
    /// Directory to walk for `prefix`, plus the string filter applied to keys.
    ///
    /// S3 prefixes are plain string prefixes, so `athletes/pho` must match
    /// `athletes/photos/...`; walk the deepest complete directory instead.
    async fn listing_base(&self, prefix: &str) -> StorageResult<(PathBuf, String)> {
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base = if dir.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir).await?
        };
        Ok((base, prefix.to_string()))
    }
}
