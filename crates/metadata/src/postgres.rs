//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{AssetRecordRepo, KeyedRecordRepo};
use crate::store::{MetadataStore, keyed_columns, unique_key_index};
use async_trait::async_trait;
use locker_core::config::PgSslMode;
use locker_core::{AssetTable, KeyedTable};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    unique_keyed_records: bool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        unique_keyed_records: bool,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(
            opts,
            max_connections,
            statement_timeout_ms,
            unique_keyed_records,
        )
        .await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password come from the environment instead of a URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        unique_keyed_records: bool,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(
            opts,
            max_connections,
            statement_timeout_ms,
            unique_keyed_records,
        )
        .await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        unique_keyed_records: bool,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            unique_keyed_records,
        };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

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

#[async_trait]
impl AssetRecordRepo for PostgresStore {
    async fn insert_asset_record(
        &self,
        table: AssetTable,
        record: &NewAssetRecord,
    ) -> MetadataResult<AssetRecordRow> {
        let id = Uuid::new_v4();
        let asset = record.asset.as_ref();
        let row = sqlx::query_as::<_, AssetRecordRow>(&format!(
            "INSERT INTO {table} (id, fields, asset_key, asset_content_type, asset_size, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6) RETURNING *"
        ))
        .bind(id)
        .bind(Json(&record.fields))
        .bind(asset.map(|a| a.key.as_str()))
        .bind(asset.and_then(|a| a.content_type.as_deref()))
        .bind(asset.map(|a| a.size))
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
        let row = sqlx::query_as::<_, AssetRecordRow>(&format!("SELECT * FROM {table} WHERE id = $1"))
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
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {table} WHERE TRUE"));
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
            "UPDATE {table} SET fields = $1, updated_at = $2 WHERE id = $3 RETURNING *"
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
            "UPDATE {table} SET asset_key = $1, asset_content_type = $2, asset_size = $3, updated_at = $4 \
             WHERE id = $5 AND asset_key IS NOT DISTINCT FROM $6 RETURNING *"
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
            "DELETE FROM {table} WHERE id = $1 RETURNING *"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("{table} record {id}")))
    }

    async fn asset_key_referenced(&self, table: AssetTable, asset_key: &str) -> MetadataResult<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE asset_key = $1)"
        ))
        .bind(asset_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl KeyedRecordRepo for PostgresStore {
    async fn insert_keyed_record(
        &self,
        table: KeyedTable,
        record: &NewKeyedRecord,
    ) -> MetadataResult<KeyedRecordRow> {
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, KeyedRecordRow>(&format!(
            "INSERT INTO {table} (id, {}, {}, fields, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) RETURNING {}",
            table.parent_column(),
            table.subject_column(),
            keyed_columns(table)
        ))
        .bind(id)
        .bind(&record.parent_key)
        .bind(&record.subject_key)
        .bind(Json(&record.fields))
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
            "SELECT {} FROM {table} WHERE id = $1",
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
            "SELECT {} FROM {table} WHERE {} = $1 AND {} = $2 ORDER BY seq",
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
            "SELECT {} FROM {table} WHERE {} = $1 ORDER BY seq",
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
            "UPDATE {table} SET fields = $1, updated_at = $2 WHERE id = $3 RETURNING {}",
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
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("{table} record {id}")));
        }
        Ok(())
    }
}
