//! Change detection for source files.
//!
//! A file's fingerprint is its size and modification time. A stored media
//! item whose fingerprint differs from the file on disk is stale, and its
//! derived data is rebuilt.

use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;

/// Fingerprint of the file at `path`: `<size>:<mtime>`.
pub fn fingerprint(path: &Path) -> io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(format!(
        "{}:{}",
        metadata.len(),
        modified.format("%Y-%m-%dT%H:%M:%S%.9f")
    ))
}
