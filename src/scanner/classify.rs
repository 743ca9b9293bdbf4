//! Media categories and the derivation policy attached to each.

use image::ImageFormat;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::db::AssetKind;

const STANDARD_IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "jfif", "png", "gif", "bmp", "webp", "ico", "tga", "pnm", "pbm", "pgm",
    "ppm", "qoi",
];

const HIGHRES_IMAGE_EXTENSIONS: &[&str] = &[
    "heif", "heic", "jp2", "j2k", "jpf", "jpx", "tif", "tiff",
    // Camera raw containers
    "dng", "cr2", "cr3", "nef", "arw", "orf", "rw2", "raf",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "avi", "mkv", "mp4", "m4v", "mpg", "mpeg", "ogg", "ogv", "mov", "webm", "wmv", "3gp",
];

/// Bytes read when sniffing a file without extension.
const SNIFF_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCategory {
    StandardImage,
    HighResImage,
    UnsupportedVideo,
    Unrecognized,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::StandardImage => "standard_image",
            MediaCategory::HighResImage => "highres_image",
            MediaCategory::UnsupportedVideo => "unsupported_video",
            MediaCategory::Unrecognized => "unrecognized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard_image" => Some(MediaCategory::StandardImage),
            "highres_image" => Some(MediaCategory::HighResImage),
            "unsupported_video" => Some(MediaCategory::UnsupportedVideo),
            "unrecognized" => Some(MediaCategory::Unrecognized),
            _ => None,
        }
    }

    /// Asset kinds a file of this category must carry, in generation order.
    pub fn derived_kinds(&self) -> &'static [AssetKind] {
        match self {
            MediaCategory::StandardImage => &[AssetKind::Thumbnail],
            MediaCategory::HighResImage => &[AssetKind::Highres, AssetKind::Thumbnail],
            MediaCategory::UnsupportedVideo => &[],
            MediaCategory::Unrecognized => &[],
        }
    }

    /// Whether files of this category become media items at all.
    pub fn is_registered(&self) -> bool {
        !matches!(self, MediaCategory::Unrecognized)
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify by file extension, case-insensitively.
pub fn classify_extension(ext: &str) -> MediaCategory {
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();

    if STANDARD_IMAGE_EXTENSIONS.contains(&ext) {
        MediaCategory::StandardImage
    } else if HIGHRES_IMAGE_EXTENSIONS.contains(&ext) {
        MediaCategory::HighResImage
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        MediaCategory::UnsupportedVideo
    } else {
        MediaCategory::Unrecognized
    }
}

/// Classify a file on disk. Files without an extension are sniffed.
pub fn classify_path(path: &Path) -> MediaCategory {
    match path.extension() {
        Some(ext) => classify_extension(&ext.to_string_lossy()),
        None => sniff(path),
    }
}

fn sniff(path: &Path) -> MediaCategory {
    let mut header = Vec::with_capacity(SNIFF_LEN);
    let read = File::open(path).and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut header));
    if read.is_err() {
        return MediaCategory::Unrecognized;
    }

    match image::guess_format(&header) {
        Ok(
            ImageFormat::Jpeg
            | ImageFormat::Png
            | ImageFormat::Gif
            | ImageFormat::Bmp
            | ImageFormat::WebP
            | ImageFormat::Ico
            | ImageFormat::Tga
            | ImageFormat::Pnm
            | ImageFormat::Qoi,
        ) => MediaCategory::StandardImage,
        _ => MediaCategory::Unrecognized,
    }
}
