//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Blob store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for blobs.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix prepended to every asset key.
        prefix: Option<String>,
        /// Access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        access_key_id: Option<String>,
        /// Secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/assets"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (testing and single-node deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Create a unique index on the keyed-record pair.
        #[serde(default)]
        unique_keyed_records: bool,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password. Prefer LOCKER_METADATA__PASSWORD.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
        /// Create a unique index on the keyed-record pair.
        #[serde(default)]
        unique_keyed_records: bool,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            unique_keyed_records: false,
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }

    /// Whether the keyed-record pair is backed by a unique index.
    pub fn unique_keyed_records(&self) -> bool {
        match self {
            MetadataConfig::Sqlite {
                unique_keyed_records,
                ..
            }
            | MetadataConfig::Postgres {
                unique_keyed_records,
                ..
            } => *unique_keyed_records,
        }
    }
}

/// Public addressing of stored assets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Base URL under which blobs are publicly readable.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_public_base_url() -> String {
    "http://localhost:9000/locker".to_string()
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            public_base_url: default_public_base_url(),
        }
    }
}

impl AssetsConfig {
    /// Validate the base URL shape.
    pub fn validate(&self) -> Result<(), String> {
        let url = self.public_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!(
                "assets.public_base_url must be an http(s) URL, got '{url}'"
            ));
        }
        Ok(())
    }
}

/// Stale blob sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Minimum age in seconds before an unreferenced blob is deleted.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Report what would be deleted without deleting.
    #[serde(default)]
    pub dry_run: bool,
    /// Maximum number of blobs examined per run.
    #[serde(default = "default_max_objects")]
    pub max_objects: u64,
}

fn default_grace_period_secs() -> u64 {
    3600 // 1 hour
}

fn default_max_objects() -> u64 {
    100_000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            dry_run: false,
            max_objects: default_max_objects(),
        }
    }
}

impl SweepConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate sweep configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.grace_period_secs > i64::MAX as u64 {
            return Err(format!(
                "sweep.grace_period_secs {} exceeds maximum value {}",
                self.grace_period_secs,
                i64::MAX
            ));
        }
        if self.max_objects == 0 {
            return Err("sweep.max_objects must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Blob store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Public asset addressing.
    #[serde(default)]
    pub assets: AssetsConfig,
    /// Stale blob sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage
            .validate()
            .and_then(|_| self.metadata.validate())
            .and_then(|_| self.assets.validate())
            .and_then(|_| self.sweep.validate())
            .map_err(crate::Error::InvalidConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::for_testing();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep.grace_period(), Duration::hours(1));
        assert!(!config.metadata.unique_keyed_records());
    }

    #[test]
    fn test_sweep_config_deserialize_partial() {
        let json = r#"{"dry_run": true}"#;
        let config: SweepConfig = serde_json::from_str(json).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.grace_period_secs, 3600);
        assert_eq!(config.max_objects, 100_000);
    }

    #[test]
    fn test_sweep_config_rejects_overflowing_grace_period() {
        let config = SweepConfig {
            grace_period_secs: u64::MAX,
            ..SweepConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());

        let valid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_force_path_style_defaults_to_false() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"http://localhost:9000"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                force_path_style, ..
            } => assert!(!force_path_style),
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_metadata_config_postgres_requires_database() {
        let json = r#"{"type":"postgres","host":"db.internal"}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());

        let json = r#"{"type":"postgres","url":"postgres://u:p@db/locker","unique_keyed_records":true}"#;
        let config: MetadataConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.unique_keyed_records());
    }

    #[test]
    fn test_assets_config_requires_http_url() {
        let config = AssetsConfig {
            public_base_url: "ftp://files".to_string(),
        };
        assert!(config.validate().is_err());
    }
}
