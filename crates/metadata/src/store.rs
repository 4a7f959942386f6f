//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{AssetRecordRepo, KeyedRecordRepo};
use async_trait::async_trait;
use locker_core::KeyedTable;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: AssetRecordRepo + KeyedRecordRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Whether this store was configured to create the keyed-pair unique
    /// index. An index created earlier is never dropped, so `false` does not
    /// rule one out.
    fn enforces_unique_keys(&self) -> bool;
}

/// Name of the optional unique index over a keyed table's pair.
pub(crate) fn unique_key_index(table: KeyedTable) -> String {
    format!("idx_{}_key_unique", table.as_str())
}

/// Column list selecting a keyed row with its pair aliased for `KeyedRecordRow`.
pub(crate) fn keyed_columns(table: KeyedTable) -> String {
    format!(
        "seq, id, {} AS parent_key, {} AS subject_key, fields, created_at, updated_at",
        table.parent_column(),
        table.subject_column()
    )
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    unique_keyed_records: bool,
}

impl SqliteStore {
    /// Create a new SQLite store and apply the schema.
    pub async fn new(path: impl AsRef<Path>, unique_keyed_records: bool) -> MetadataResult<Self> {
        let path = path.as_ref();

        let opts = if path == Path::new(":memory:") {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        };
        let opts = opts.foreign_keys(true).busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; a single never-recycled connection also keeps
            // a `:memory:` database alive.
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            unique_keyed_records,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            unique_keyed_records,
            "SQLite metadata store ready"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;

        let table = KeyedTable::Attendance;
        let index = unique_key_index(table);
        if self.unique_keyed_records {
            let statement = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} ({}, {})",
                table.parent_column(),
                table.subject_column()
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                        MetadataError::Constraint(format!(
                            "cannot create {index}: {table} already holds duplicate keys"
                        ))
                    }
                    other => other.into(),
                })?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn enforces_unique_keys(&self) -> bool {
        self.unique_keyed_records
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use locker_core::AssetTable;
    use serde_json::Value;
    use sqlx::QueryBuilder;
    use sqlx::types::Json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl AssetRecordRepo for SqliteStore {
        async fn insert_asset_record(
            &self,
            table: AssetTable,
            record: &NewAssetRecord,
        ) -> MetadataResult<AssetRecordRow> {
            let id = Uuid::new_v4();
            let asset = record.asset.as_ref();
            let row = sqlx::query_as::<_, AssetRecordRow>(&format!(
                "INSERT INTO {table} (id, fields, asset_key, asset_content_type, asset_size, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *"
            ))
            .bind(id)
            .bind(Json(&record.fields))
            .bind(asset.map(|a| a.key.as_str()))
            .bind(asset.and_then(|a| a.content_type.as_deref()))
            .bind(asset.map(|a| a.size))
            .bind(record.created_at)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MetadataError::from_insert(e, || format!("{table} record {id}")))?;
            Ok(row)
        }

        async fn get_asset_record(
            &self,
            table: AssetTable,
            id: Uuid,
        ) -> MetadataResult<Option<AssetRecordRow>> {
            let row =
                sqlx::query_as::<_, AssetRecordRow>(&format!("SELECT * FROM {table} WHERE id = ?"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_asset_records(
            &self,
            table: AssetTable,
            filter: &AssetRecordFilter,
        ) -> MetadataResult<Vec<AssetRecordRow>> {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {table} WHERE 1 = 1"));
            if let Some(after) = filter.created_after {
                qb.push(" AND created_at >= ").push_bind(after);
            }
            if let Some(before) = filter.created_before {
                qb.push(" AND created_at < ").push_bind(before);
            }
            match filter.with_asset {
                Some(true) => {
                    qb.push(" AND asset_key IS NOT NULL");
                }
                Some(false) => {
                    qb.push(" AND asset_key IS NULL");
                }
                None => {}
            }
            qb.push(filter.order.as_sql());
            if let Some(limit) = filter.limit {
                qb.push(" LIMIT ").push_bind(i64::from(limit));
            }

            let rows = qb
                .build_query_as::<AssetRecordRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn update_asset_fields(
            &self,
            table: AssetTable,
            id: Uuid,
            fields: &Value,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<AssetRecordRow> {
            sqlx::query_as::<_, AssetRecordRow>(&format!(
                "UPDATE {table} SET fields = ?, updated_at = ? WHERE id = ? RETURNING *"
            ))
            .bind(Json(fields))
            .bind(updated_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("{table} record {id}")))
        }

        async fn swap_asset(
            &self,
            table: AssetTable,
            id: Uuid,
            expected: Option<&str>,
            new: Option<&StoredAsset>,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<Option<AssetRecordRow>> {
            let swapped = sqlx::query_as::<_, AssetRecordRow>(&format!(
                "UPDATE {table} SET asset_key = ?, asset_content_type = ?, asset_size = ?, updated_at = ? \
                 WHERE id = ? AND asset_key IS ? RETURNING *"
            ))
            .bind(new.map(|a| a.key.as_str()))
            .bind(new.and_then(|a| a.content_type.as_deref()))
            .bind(new.map(|a| a.size))
            .bind(updated_at)
            .bind(id)
            .bind(expected)
            .fetch_optional(&self.pool)
            .await?;

            if swapped.is_some() {
                return Ok(swapped);
            }
            match self.get_asset_record(table, id).await? {
                Some(_) => Ok(None),
                None => Err(MetadataError::NotFound(format!("{table} record {id}"))),
            }
        }

        async fn delete_asset_record(
            &self,
            table: AssetTable,
            id: Uuid,
        ) -> MetadataResult<AssetRecordRow> {
            sqlx::query_as::<_, AssetRecordRow>(&format!(
                "DELETE FROM {table} WHERE id = ? RETURNING *"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("{table} record {id}")))
        }

        async fn asset_key_referenced(
            &self,
            table: AssetTable,
            asset_key: &str,
        ) -> MetadataResult<bool> {
            let row: Option<(i64,)> = sqlx::query_as(&format!(
                "SELECT 1 FROM {table} WHERE asset_key = ? LIMIT 1"
            ))
            .bind(asset_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.is_some())
        }
    }

    #[async_trait]
    impl KeyedRecordRepo for SqliteStore {
        async fn insert_keyed_record(
            &self,
            table: KeyedTable,
            record: &NewKeyedRecord,
        ) -> MetadataResult<KeyedRecordRow> {
            let id = Uuid::new_v4();
            let row = sqlx::query_as::<_, KeyedRecordRow>(&format!(
                "INSERT INTO {table} (id, {}, {}, fields, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
                table.parent_column(),
                table.subject_column(),
                keyed_columns(table)
            ))
            .bind(id)
            .bind(&record.parent_key)
            .bind(&record.subject_key)
            .bind(Json(&record.fields))
            .bind(record.created_at)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from_insert(e, || {
                    format!(
                        "{table} record ({}, {})",
                        record.parent_key, record.subject_key
                    )
                })
            })?;
            Ok(row)
        }

        async fn get_keyed_record(
            &self,
            table: KeyedTable,
            id: Uuid,
        ) -> MetadataResult<Option<KeyedRecordRow>> {
            let row = sqlx::query_as::<_, KeyedRecordRow>(&format!(
                "SELECT {} FROM {table} WHERE id = ?",
                keyed_columns(table)
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_keyed_records(
            &self,
            table: KeyedTable,
            parent_key: &str,
            subject_key: &str,
        ) -> MetadataResult<Vec<KeyedRecordRow>> {
            let rows = sqlx::query_as::<_, KeyedRecordRow>(&format!(
                "SELECT {} FROM {table} WHERE {} = ? AND {} = ? ORDER BY seq",
                keyed_columns(table),
                table.parent_column(),
                table.subject_column()
            ))
            .bind(parent_key)
            .bind(subject_key)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_keyed_records(
            &self,
            table: KeyedTable,
            parent_key: &str,
        ) -> MetadataResult<Vec<KeyedRecordRow>> {
            let rows = sqlx::query_as::<_, KeyedRecordRow>(&format!(
                "SELECT {} FROM {table} WHERE {} = ? ORDER BY seq",
                keyed_columns(table),
                table.parent_column()
            ))
            .bind(parent_key)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_keyed_fields(
            &self,
            table: KeyedTable,
            id: Uuid,
            fields: &Value,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<KeyedRecordRow> {
            sqlx::query_as::<_, KeyedRecordRow>(&format!(
                "UPDATE {table} SET fields = ?, updated_at = ? WHERE id = ? RETURNING {}",
                keyed_columns(table)
            ))
            .bind(Json(fields))
            .bind(updated_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("{table} record {id}")))
        }

        async fn delete_keyed_record(&self, table: KeyedTable, id: Uuid) -> MetadataResult<()> {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("{table} record {id}")));
            }
            Ok(())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Asset tables share one layout; asset_key is NULL until a blob is attached.
CREATE TABLE IF NOT EXISTS athletes (
    id BLOB PRIMARY KEY,
    fields TEXT NOT NULL DEFAULT '{}',
    asset_key TEXT,
    asset_content_type TEXT,
    asset_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_athletes_asset_key ON athletes(asset_key);
CREATE INDEX IF NOT EXISTS idx_athletes_created_at ON athletes(created_at);

CREATE TABLE IF NOT EXISTS exercises (
    id BLOB PRIMARY KEY,
    fields TEXT NOT NULL DEFAULT '{}',
    asset_key TEXT,
    asset_content_type TEXT,
    asset_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exercises_asset_key ON exercises(asset_key);
CREATE INDEX IF NOT EXISTS idx_exercises_created_at ON exercises(created_at);

CREATE TABLE IF NOT EXISTS medical_records (
    id BLOB PRIMARY KEY,
    fields TEXT NOT NULL DEFAULT '{}',
    asset_key TEXT,
    asset_content_type TEXT,
    asset_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_medical_records_asset_key ON medical_records(asset_key);
CREATE INDEX IF NOT EXISTS idx_medical_records_created_at ON medical_records(created_at);

CREATE TABLE IF NOT EXISTS library_videos (
    id BLOB PRIMARY KEY,
    fields TEXT NOT NULL DEFAULT '{}',
    asset_key TEXT,
    asset_content_type TEXT,
    asset_size INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_library_videos_asset_key ON library_videos(asset_key);
CREATE INDEX IF NOT EXISTS idx_library_videos_created_at ON library_videos(created_at);

-- Attendance: one row per (planning_id, athlete_id), not enforced by default.
CREATE TABLE IF NOT EXISTS attendance (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id BLOB NOT NULL UNIQUE,
    planning_id TEXT NOT NULL,
    athlete_id TEXT NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_key ON attendance(planning_id, athlete_id);
"#;
