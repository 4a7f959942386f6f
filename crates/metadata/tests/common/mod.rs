//! Metadata store test utilities.

use locker_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// A SQLite test store that removes its database file on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a file-backed SQLite store.
    pub async fn new(unique_keyed_records: bool) -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, unique_keyed_records).await?;

        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// PostgreSQL test store backed by a testcontainer.
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    /// Start a PostgreSQL container and connect to it.
    pub async fn new(unique_keyed_records: bool) -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!("Failed to start PostgreSQL container: {e}"))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = PostgresStore::from_url(&url, 5, None, unique_keyed_records).await?;

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// Run a test against both SQLite and PostgreSQL backends.
///
/// PostgreSQL is skipped when `SKIP_POSTGRES_TESTS` is set or Docker is unavailable.
#[allow(dead_code)]
pub async fn run_metadata_test_both<F, Fut>(unique_keyed_records: bool, test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new(unique_keyed_records)
        .await
        .expect("Failed to create SQLite test metadata");
    test_fn.clone()(sqlite.store()).await;

    if std::env::var("SKIP_POSTGRES_TESTS").is_err() {
        match PostgresTestMetadata::new(unique_keyed_records).await {
            Ok(postgres) => test_fn(postgres.store()).await,
            Err(err) => eprintln!("Skipping PostgreSQL metadata tests: {err}"),
        }
    }
}
