//! Core domain types for the Locker asset-consistency layer.
//!
//! This crate defines the data model shared by the other crates:
//! - Asset and keyed tables
//! - Asset keys, file-name sanitising and public URL projection
//! - Application configuration

pub mod asset;
pub mod config;
pub mod error;
pub mod table;

pub use asset::{AssetKey, AssetUrls, KeyDiscriminator, sanitize_file_name};
pub use error::{Error, Result};
pub use table::{AssetTable, KeyedTable};
