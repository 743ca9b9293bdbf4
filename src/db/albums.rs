//! Album records.

use std::path::PathBuf;

/// A directory-backed collection owned by a user.
///
/// Albums are created by the caller before a scan; the scanner only
/// discovers media underneath `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: i64,
    pub title: String,
    pub path: PathBuf,
    pub owner: String,
}
