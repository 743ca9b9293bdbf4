//! Media item and derived asset records.

use std::fmt;
use std::path::PathBuf;

use crate::scanner::MediaCategory;

/// The two kinds of generated representation a media item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetKind {
    /// Full-resolution re-encode of a high-resolution source.
    Highres,
    /// Downscaled display image; the input for face detection.
    Thumbnail,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Highres => "highres",
            AssetKind::Thumbnail => "thumbnail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "highres" => Some(AssetKind::Highres),
            "thumbnail" => Some(AssetKind::Thumbnail),
            _ => None,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical file discovered under an album.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: i64,
    pub album_id: i64,
    /// File name, e.g. `boy1.jpg`.
    pub title: String,
    /// Path relative to the album root, `/`-separated. Unique per album.
    pub relative_path: String,
    pub path: PathBuf,
    pub category: MediaCategory,
    pub fingerprint: String,
    /// Set once face detection ran against the current thumbnail.
    pub faces_scanned_at: Option<String>,
}

/// Values the scanner supplies when registering a file.
#[derive(Debug, Clone)]
pub struct NewMediaItem {
    pub title: String,
    pub relative_path: String,
    pub path: PathBuf,
    pub category: MediaCategory,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Unchanged,
    /// Fingerprint differed; the previous assets and faces were destroyed.
    Changed,
}

/// Derived data removed from the store together with, or on behalf of, a media item.
///
/// Asset files on disk and in-memory face groups are not touched by the
/// store; callers use this to clean those up.
#[derive(Debug, Clone, Default)]
pub struct RemovedDerived {
    pub assets: Vec<DerivedAsset>,
    pub face_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct MediaUpsert {
    pub item: MediaItem,
    pub outcome: UpsertOutcome,
    pub removed: RemovedDerived,
}

/// A generated thumbnail or highres image.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedAsset {
    pub id: i64,
    pub media_id: i64,
    pub kind: AssetKind,
    /// Boundary name, e.g. `thumbnail_boy1.jpg`.
    pub name: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub kind: AssetKind,
    pub name: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Filter for the query helpers. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    pub album_id: Option<i64>,
    pub media_id: Option<i64>,
    pub category: Option<MediaCategory>,
    pub title: Option<String>,
}

impl MediaFilter {
    pub fn album(album_id: i64) -> Self {
        Self {
            album_id: Some(album_id),
            ..Self::default()
        }
    }

    pub fn media(media_id: i64) -> Self {
        Self {
            media_id: Some(media_id),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: MediaCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}
