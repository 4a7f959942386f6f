//! Asset keys and their public URL projection.
//!
//! The [`AssetKey`] is the authoritative address of a blob and is persisted
//! verbatim next to the metadata row. URLs are derived from it on demand and
//! are never parsed back into keys.

use crate::table::AssetTable;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum key length in bytes (S3 limit).
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum length of the sanitized file-name part of a key, in characters.
pub const MAX_FILE_NAME_CHARS: usize = 120;

/// Characters left unescaped in URL path segments (RFC 3986 unreserved).
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Canonical storage address of a blob.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey(String);

impl AssetKey {
    /// Create from a string, validating format.
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidAssetKey("key is empty".to_string()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(crate::Error::InvalidAssetKey(format!(
                "key is {} bytes (max {MAX_KEY_LEN})",
                key.len()
            )));
        }
        if key.starts_with('/') {
            return Err(crate::Error::InvalidAssetKey(format!(
                "key must be relative: {key}"
            )));
        }
        if key.chars().any(|c| c == '\\' || c.is_control()) {
            return Err(crate::Error::InvalidAssetKey(format!(
                "key contains a backslash or control character: {key:?}"
            )));
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(crate::Error::InvalidAssetKey(format!(
                "key contains an empty or relative segment: {key}"
            )));
        }
        Ok(Self(key))
    }

    /// Generate a fresh key for an asset of `table` uploaded as `original_name`.
    ///
    /// Layout: `{namespace}/{discriminator}-{sanitized name}`.
    pub fn generate(table: AssetTable, original_name: &str) -> Self {
        Self::with_discriminator(table, &KeyDiscriminator::fresh(), original_name)
    }

    /// Build a key from an explicit discriminator.
    pub fn with_discriminator(
        table: AssetTable,
        discriminator: &KeyDiscriminator,
        original_name: &str,
    ) -> Self {
        // Namespace, discriminator and sanitized name are all valid segments.
        Self(format!(
            "{}/{}-{}",
            table.namespace(),
            discriminator,
            sanitize_file_name(original_name)
        ))
    }

    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key lives in the namespace of `table`.
    pub fn belongs_to(&self, table: AssetTable) -> bool {
        self.0.starts_with(&table.key_prefix())
    }
}

impl TryFrom<String> for AssetKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<AssetKey> for String {
    fn from(key: AssetKey) -> Self {
        key.0
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetKey({})", self.0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uniqueness component of a generated key.
///
/// Millisecond timestamp followed by 8 random hex characters, so two keys
/// generated for the same record and file name never collide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDiscriminator(String);

impl KeyDiscriminator {
    /// A new discriminator based on the current time.
    pub fn fresh() -> Self {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{millis}{}", &random[..8]))
    }

    /// A fixed discriminator, e.g. a record id.
    pub fn fixed(value: impl fmt::Display) -> Self {
        let value = sanitize_file_name(&value.to_string());
        Self(value)
    }
}

impl fmt::Display for KeyDiscriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce an uploaded file name to a single safe key segment.
///
/// Only the last path component survives. Unicode letters and digits are kept
/// as-is (the key is stored verbatim and only escaped when projected into a
/// URL); anything else except `.`, `-` and `_` becomes `_`.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let mut sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    let without_dots = sanitized.trim_start_matches('.');
    if without_dots.len() != sanitized.len() {
        sanitized = without_dots.to_string();
    }

    if sanitized.is_empty() {
        "asset".to_string()
    } else {
        sanitized
    }
}

/// Projects asset keys onto public-read URLs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetUrls {
    base: String,
}

impl AssetUrls {
    /// Create from the configured public base URL.
    pub fn new(public_base_url: &str) -> Self {
        Self {
            base: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Public URL for `key`, with every path segment percent-encoded.
    pub fn url_for(&self, key: &AssetKey) -> String {
        let mut url = self.base.clone();
        for segment in key.as_str().split('/') {
            url.push('/');
            url.extend(utf8_percent_encode(segment, SEGMENT));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_last_component() {
        assert_eq!(sanitize_file_name("C:\\Users\\me\\photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("team photo (1).jpg"), "team_photo__1_.jpg");
    }

    #[test]
    fn sanitize_keeps_unicode_letters() {
        assert_eq!(sanitize_file_name("équipe_été.png"), "équipe_été.png");
    }

    #[test]
    fn sanitize_strips_leading_dots_and_falls_back() {
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("..."), "asset");
        assert_eq!(sanitize_file_name(""), "asset");
        assert_eq!(sanitize_file_name("dir/"), "asset");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_file_name(&long).chars().count(), MAX_FILE_NAME_CHARS);
    }

    #[test]
    fn generated_key_layout() {
        let key = AssetKey::with_discriminator(
            AssetTable::Athletes,
            &KeyDiscriminator::fixed(42),
            "photo.jpg",
        );
        assert_eq!(key.as_str(), "athletes/photos/42-photo.jpg");
        assert!(key.belongs_to(AssetTable::Athletes));
        assert!(!key.belongs_to(AssetTable::Exercises));
        assert!(AssetKey::new(key.as_str()).is_ok());
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = AssetKey::generate(AssetTable::Exercises, "squat.mp4");
        let b = AssetKey::generate(AssetTable::Exercises, "squat.mp4");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("exercises/videos/"));
        assert!(a.as_str().ends_with("-squat.mp4"));
    }

    #[test]
    fn key_validation() {
        assert!(AssetKey::new("").is_err());
        assert!(AssetKey::new("/abs/key").is_err());
        assert!(AssetKey::new("a//b").is_err());
        assert!(AssetKey::new("a/../b").is_err());
        assert!(AssetKey::new("a/./b").is_err());
        assert!(AssetKey::new("a\\b").is_err());
        assert!(AssetKey::new("a/b\n").is_err());
        assert!(AssetKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(AssetKey::new("medical/documents/1-bilan médical.pdf").is_ok());
    }

    #[test]
    fn key_serde_validates() {
        let ok: AssetKey = serde_json::from_str("\"library/videos/1-a.mp4\"").unwrap();
        assert_eq!(ok.as_str(), "library/videos/1-a.mp4");
        assert!(serde_json::from_str::<AssetKey>("\"../x\"").is_err());
    }

    #[test]
    fn url_projection_encodes_segments() {
        let urls = AssetUrls::new("https://cdn.example.com/locker/");
        let key = AssetKey::new("medical/documents/17-bilan médical #2.pdf").unwrap();
        assert_eq!(
            urls.url_for(&key),
            "https://cdn.example.com/locker/medical/documents/17-bilan%20m%C3%A9dical%20%232.pdf"
        );
    }

    #[test]
    fn url_projection_follows_configuration() {
        let key = AssetKey::new("athletes/photos/42-photo.jpg").unwrap();
        let old = AssetUrls::new("http://localhost:9000/bucket");
        let new = AssetUrls::new("https://cdn.example.com");
        assert_eq!(old.url_for(&key), "http://localhost:9000/bucket/athletes/photos/42-photo.jpg");
        assert_eq!(new.url_for(&key), "https://cdn.example.com/athletes/photos/42-photo.jpg");
    }
}
