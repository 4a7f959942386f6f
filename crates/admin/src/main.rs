//! Locker operator CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use locker_assets::StaleBlobSweeper;
use locker_core::config::AppConfig;
use locker_metadata::MetadataStore;
use locker_storage::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Locker - asset consistency tooling
#[derive(Parser, Debug)]
#[command(name = "lockerctl")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "LOCKER_CONFIG",
        default_value = "config/locker.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify connectivity to the blob store and the metadata store
    Check,
    /// Delete blobs no record references any more
    Sweep {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args.config)?;
    let (storage, metadata) = open_stores(&config).await?;

    match args.command {
        Command::Check => check(storage, metadata).await,
        Command::Sweep { dry_run } => {
            let mut sweep_config = config.sweep.clone();
            sweep_config.dry_run |= dry_run;
            let sweeper = StaleBlobSweeper::new(storage, metadata, sweep_config)
                .context("invalid sweep configuration")?;
            let stats = sweeper.sweep().await.context("sweep failed")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

/// Load configuration from an optional TOML file overlaid with `LOCKER_*`
/// environment variables.
fn load_config(config_path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = Path::new(config_path).exists();

    if has_config_file {
        tracing::info!(config_path = %config_path, "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("No config file found at {}", config_path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("LOCKER_") && key != "LOCKER_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: lockerctl --config /path/to/locker.toml check\n  \
             2. Environment variables: LOCKER_STORAGE__TYPE=filesystem \
             LOCKER_STORAGE__PATH=/var/lib/locker lockerctl check\n\n\
             See config/locker.example.toml for example configuration."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("LOCKER_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn open_stores(
    config: &AppConfig,
) -> Result<(Arc<dyn ObjectStore>, Arc<dyn MetadataStore>)> {
    let storage = locker_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let metadata = locker_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    Ok((storage, metadata))
}

async fn check(storage: Arc<dyn ObjectStore>, metadata: Arc<dyn MetadataStore>) -> Result<()> {
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    println!("storage ({}): ok", storage.backend_name());

    metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    println!(
        "metadata: ok (unique keyed records: {})",
        metadata.enforces_unique_keys()
    );
    Ok(())
}
