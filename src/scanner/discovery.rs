use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use walkdir::WalkDir;

use super::classify::{classify_path, MediaCategory};

/// A registrable file found under an album root.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// `/`-separated path below the album root.
    pub relative_path: String,
    pub category: MediaCategory,
}

#[derive(Debug, Default)]
pub struct WalkSummary {
    pub discovered: usize,
    /// Relative paths of every registrable file found.
    pub seen: HashSet<String>,
    /// Entries that could not be read, with the reason.
    pub failures: Vec<(PathBuf, String)>,
    /// The walk stopped early (cancelled or the consumer went away).
    pub interrupted: bool,
}

impl WalkSummary {
    /// True when every entry under the root was visited.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failures.is_empty()
    }
}

/// Walk `root` and push every registrable file into `tx`.
///
/// Blocks when the channel is full. Unreadable entries are recorded and
/// skipped; the walk itself keeps going.
pub fn walk_album(root: &Path, tx: &SyncSender<DiscoveredFile>, cancel: &AtomicBool) -> WalkSummary {
    let mut summary = WalkSummary::default();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        if cancel.load(Ordering::Relaxed) {
            summary.interrupted = true;
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                summary.failures.push((path, e.to_string()));
                continue;
            }
        };

        let path = entry.path();
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // Linked files are registered under the link's own path.
            // Linked directories are not descended.
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "Skipping symlink that is not a file");
                continue;
            }
        } else if !file_type.is_file() {
            continue;
        }

        let category = classify_path(path);
        if !category.is_registered() {
            tracing::trace!(path = %path.display(), "Ignoring unrecognized file");
            continue;
        }

        let Some(relative_path) = relative_path(root, path) else {
            continue;
        };

        summary.discovered += 1;
        summary.seen.insert(relative_path.clone());
        let file = DiscoveredFile {
            path: path.to_path_buf(),
            relative_path,
            category,
        };
        if tx.send(file).is_err() {
            summary.interrupted = true;
            break;
        }
    }

    summary
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}
