//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid asset key: {0}")]
    InvalidAssetKey(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
