//! Tables known to the consistency core.
//!
//! Asset tables own at most one binary asset per row. Keyed tables identify a
//! row by a composite of two foreign references instead of by its id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A metadata table whose rows may reference a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetTable {
    /// Athlete profiles with a photo.
    Athletes,
    /// Exercise catalogue entries with a demonstration video.
    Exercises,
    /// Medical records with a PDF attachment.
    MedicalRecords,
    /// Video library entries.
    LibraryVideos,
}

impl AssetTable {
    /// Every asset table, in schema order.
    pub const ALL: [AssetTable; 4] = [
        Self::Athletes,
        Self::Exercises,
        Self::MedicalRecords,
        Self::LibraryVideos,
    ];

    /// SQL table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Athletes => "athletes",
            Self::Exercises => "exercises",
            Self::MedicalRecords => "medical_records",
            Self::LibraryVideos => "library_videos",
        }
    }

    /// Blob key namespace for assets owned by this table.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Athletes => "athletes/photos",
            Self::Exercises => "exercises/videos",
            Self::MedicalRecords => "medical/documents",
            Self::LibraryVideos => "library/videos",
        }
    }

    /// Listing prefix for the namespace (with trailing slash).
    pub fn key_prefix(&self) -> String {
        format!("{}/", self.namespace())
    }
}

impl fmt::Display for AssetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetTable {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownTable(s.to_string()))
    }
}

/// A metadata table whose identity is a `(parent, subject)` key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyedTable {
    /// Attendance of an athlete at a planned session.
    Attendance,
}

impl KeyedTable {
    /// SQL table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
        }
    }

    /// Column holding the parent reference.
    pub fn parent_column(&self) -> &'static str {
        match self {
            Self::Attendance => "planning_id",
        }
    }

    /// Column holding the subject reference.
    pub fn subject_column(&self) -> &'static str {
        match self {
            Self::Attendance => "athlete_id",
        }
    }
}

impl fmt::Display for KeyedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
