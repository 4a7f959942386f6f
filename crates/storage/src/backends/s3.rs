//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Marker carried by lazy credential errors so they surface as config errors.
const CREDENTIALS_ERROR_MARKER: &str = "locker-s3-lazy-credentials";

/// Lazily builds the AWS default credentials chain on the first signed request.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let region = aws_config::Region::new(self.region.clone());
        let chain = self
            .chain
            .get_or_init(|| async move {
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(region)
                    .build()
                    .await
            })
            .await;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER) {
        return StorageError::Config(
            "S3 credential resolution failed. Configure access_key_id/secret_access_key or provide ambient AWS credentials."
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

fn is_status<E>(err: &SdkError<E>, status: u16) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == status)
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` addressing, which MinIO
    /// and most self-hosted S3 services need.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "locker-config");
            builder = builder.credentials_provider(credentials);
        } else {
            builder =
                builder.credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region));
        }

        if let Some(endpoint_url) = endpoint {
            // Accept bare host:port endpoints such as "minio:9000".
            let lower = endpoint_url.to_ascii_lowercase();
            let endpoint_url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            builder = builder.endpoint_url(endpoint_url);
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(prefix: Option<&str>, full_key: &str) -> String {
        match prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if is_status(&err, 404) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        key = %key,
                        timestamp = dt.secs(),
                        error = %e,
                        "Failed to convert S3 timestamp, object will be skipped by the sweeper"
                    );
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(content_type.map(str::to_string))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // DeleteObject succeeds on missing keys; check first so NotFound stays distinct.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        use futures::TryStreamExt;

        self.list_stream(prefix).await?.try_collect().await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let full_prefix = self.full_key(prefix);
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let strip = self.prefix.clone();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let output = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&full_prefix)
                    .set_continuation_token(continuation_token.take())
                    .send()
                    .await
                    .map_err(map_s3_operation_error)?;

                for obj in output.contents() {
                    if let Some(obj_key) = obj.key() {
                        yield Self::strip_prefix(strip.as_deref(), obj_key);
                    }
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let check = async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| {
                    if is_status(&e, 404) {
                        StorageError::Config(format!("bucket does not exist: {}", self.bucket))
                    } else {
                        map_s3_operation_error(e)
                    }
                })?;
            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}
