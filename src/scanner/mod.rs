pub mod change_detection;
pub mod classify;
pub mod discovery;

use anyhow::{anyhow, bail, Context, Result};
use rayon::iter::{ParallelBridge, ParallelIterator};
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;

use crate::config::Config;
use crate::db::{
    Album, AssetKind, DerivedAsset, MediaFilter, MediaStore, NewMediaItem, UpsertOutcome,
};
use crate::derive::{remove_asset_files, DerivationEngine};
use crate::error::FaceError;
use crate::faces::{detector_from_config, Assignment, FaceClusters, FaceDetector, FaceProcessor};

pub use classify::{classify_extension, classify_path, MediaCategory};
pub use discovery::{walk_album, DiscoveredFile, WalkSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Traversal,
    Derivation,
    Detection,
    Persistence,
}

#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { album_id: i64 },
    Processing { current: usize, path: String },
    Error { path: String, stage: FailureStage, message: String },
    Completed { discovered: usize, new: usize, updated: usize, removed: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub discovered: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub assets_generated: usize,
    pub faces_detected: usize,
    pub groups_created: usize,
    /// The scan was cancelled before every file was processed.
    pub cancelled: bool,
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    fn merge(mut self, other: ScanReport) -> ScanReport {
        self.discovered += other.discovered;
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.removed += other.removed;
        self.assets_generated += other.assets_generated;
        self.faces_detected += other.faces_detected;
        self.groups_created += other.groups_created;
        self.cancelled |= other.cancelled;
        self.failures.extend(other.failures);
        self
    }

    fn fail(&mut self, path: impl Into<PathBuf>, stage: FailureStage, message: impl ToString) {
        self.failures.push(ScanFailure {
            path: path.into(),
            stage,
            message: message.to_string(),
        });
    }

    pub fn failures_at(&self, stage: FailureStage) -> impl Iterator<Item = &ScanFailure> {
        self.failures.iter().filter(move |f| f.stage == stage)
    }
}

/// Drives classification, derivation, face detection and clustering for
/// every file under an album.
pub struct Scanner {
    config: Config,
    store: Arc<dyn MediaStore>,
    engine: DerivationEngine,
    faces: Option<FaceProcessor>,
}

impl Scanner {
    pub fn new(
        config: Config,
        store: Arc<dyn MediaStore>,
        detector: Option<Arc<dyn FaceDetector>>,
    ) -> Self {
        let engine = DerivationEngine::new(&config);
        Self {
            config,
            store,
            engine,
            faces: detector.map(FaceProcessor::new),
        }
    }

    /// Scanner using the ONNX face detector when `faces.enabled` is set.
    pub fn from_config(config: Config, store: Arc<dyn MediaStore>) -> Self {
        let detector = detector_from_config(&config.faces);
        Self::new(config, store, detector)
    }

    /// Scan every file under `album.path`.
    ///
    /// Per-file failures are collected in the report; only setup problems
    /// (unreadable root, store unavailable at start) return an error.
    pub fn scan_album(
        &self,
        album: &Album,
        progress_tx: Option<mpsc::Sender<ScanProgress>>,
        cancel: Arc<AtomicBool>,
    ) -> Result<ScanReport> {
        if !album.path.is_dir() {
            bail!("Album root {} is not a directory", album.path.display());
        }

        let started = Instant::now();
        tracing::info!(album_id = album.id, root = %album.path.display(), "Scanning album");
        send(&progress_tx, ScanProgress::Started { album_id: album.id });

        let mut report = ScanReport::default();

        let clusters = match self.faces {
            Some(_) => {
                let clusters = FaceClusters::load(self.store.as_ref(), self.config.faces.match_distance)
                    .context("Failed to load face groups")?;
                report.groups_created += clusters
                    .assign_unassigned(self.store.as_ref())
                    .context("Failed to group pending faces")?;
                Some(clusters)
            }
            None => None,
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.scanner.effective_workers())
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .context("Failed to build scan worker pool")?;

        let (tx, rx) = mpsc::sync_channel(self.config.scanner.queue_depth.max(1));
        let root = album.path.clone();
        let walk_cancel = Arc::clone(&cancel);
        let walker = std::thread::Builder::new()
            .name("scan-walk".to_string())
            .spawn(move || walk_album(&root, &tx, &walk_cancel))
            .context("Failed to start directory walk")?;

        let processed = AtomicUsize::new(0);
        let files = pool.install(|| {
            rx.into_iter()
                .par_bridge()
                .map(|file| {
                    if cancel.load(Ordering::Relaxed) {
                        return ScanReport {
                            cancelled: true,
                            ..ScanReport::default()
                        };
                    }

                    let current = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    send(
                        &progress_tx,
                        ScanProgress::Processing {
                            current,
                            path: file.relative_path.clone(),
                        },
                    );

                    let file_report = self.process_file(album, &file, clusters.as_ref());
                    for failure in &file_report.failures {
                        send(
                            &progress_tx,
                            ScanProgress::Error {
                                path: failure.path.display().to_string(),
                                stage: failure.stage,
                                message: failure.message.clone(),
                            },
                        );
                    }
                    file_report
                })
                .reduce(ScanReport::default, ScanReport::merge)
        });

        let walk = walker
            .join()
            .map_err(|_| anyhow!("Directory walk panicked"))?;

        report = report.merge(files);
        report.cancelled |= cancel.load(Ordering::Relaxed);
        self.finish_walk(album, &walk, clusters.as_ref(), &mut report);

        tracing::info!(
            album_id = album.id,
            discovered = report.discovered,
            new = report.new,
            updated = report.updated,
            removed = report.removed,
            assets = report.assets_generated,
            faces = report.faces_detected,
            groups = clusters.as_ref().map_or(0, FaceClusters::len),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan finished"
        );
        send(
            &progress_tx,
            ScanProgress::Completed {
                discovered: report.discovered,
                new: report.new,
                updated: report.updated,
                removed: report.removed,
            },
        );

        Ok(report)
    }

    /// Full pipeline for one file. Never fails; problems are recorded.
    fn process_file(
        &self,
        album: &Album,
        file: &DiscoveredFile,
        clusters: Option<&FaceClusters>,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let store = self.store.as_ref();

        let fingerprint = match change_detection::fingerprint(&file.path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                report.fail(&file.path, FailureStage::Traversal, e);
                return report;
            }
        };

        let title = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.relative_path.clone());

        let upsert = match store.upsert_media(
            album.id,
            NewMediaItem {
                title,
                relative_path: file.relative_path.clone(),
                path: file.path.clone(),
                category: file.category,
                fingerprint,
            },
        ) {
            Ok(upsert) => upsert,
            Err(e) => {
                report.fail(&file.path, FailureStage::Persistence, e);
                return report;
            }
        };

        match upsert.outcome {
            UpsertOutcome::New => report.new += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
            UpsertOutcome::Changed => {
                report.updated += 1;
                tracing::debug!(path = %file.path.display(), "Source changed, rebuilding derived data");
                remove_asset_files(&upsert.removed.assets);
                if let Some(clusters) = clusters {
                    if let Err(e) = clusters.forget(&upsert.removed.face_ids) {
                        report.fail(&file.path, FailureStage::Persistence, e);
                    }
                }
            }
        }
        let item = upsert.item;

        let kinds = item.category.derived_kinds();
        if kinds.is_empty() {
            return report;
        }

        let mut assets: Vec<DerivedAsset> = match store.assets_for_media(item.id) {
            Ok(assets) => assets.into_iter().filter(|a| a.path.is_file()).collect(),
            Err(e) => {
                report.fail(&file.path, FailureStage::Persistence, e);
                return report;
            }
        };
        let missing: Vec<AssetKind> = kinds
            .iter()
            .copied()
            .filter(|kind| !assets.iter().any(|a| a.kind == *kind))
            .collect();

        if !missing.is_empty() {
            for outcome in self.engine.derive(&item, &missing) {
                let asset = match outcome.result {
                    Ok(asset) => asset,
                    Err(e) => {
                        report.fail(&file.path, FailureStage::Derivation, e);
                        continue;
                    }
                };

                let written = asset.path.clone();
                match store.upsert_asset(item.id, asset) {
                    Ok((stored, previous)) => {
                        if let Some(previous) = previous.filter(|p| p.path != stored.path) {
                            remove_asset_files(&[previous]);
                        }
                        report.assets_generated += 1;
                        assets.retain(|a| a.kind != stored.kind);
                        assets.push(stored);
                    }
                    Err(e) => {
                        // No record points at the file
                        let _ = std::fs::remove_file(&written);
                        report.fail(&file.path, FailureStage::Persistence, e);
                        return report;
                    }
                }
            }
        }

        if item.faces_scanned_at.is_some() {
            return report;
        }
        let (Some(processor), Some(clusters)) = (self.faces.as_ref(), clusters) else {
            return report;
        };
        let Some(thumbnail) = assets.iter().find(|a| a.kind == AssetKind::Thumbnail) else {
            return report;
        };

        let faces = match processor.process_thumbnail(store, &item, thumbnail) {
            Ok(faces) => faces,
            Err(FaceError::Detection(e)) => {
                tracing::warn!(path = %file.path.display(), error = %e, "Face detection failed");
                report.fail(&file.path, FailureStage::Detection, e);
                return report;
            }
            Err(FaceError::Store(e)) => {
                report.fail(&file.path, FailureStage::Persistence, e);
                return report;
            }
        };

        report.faces_detected += faces.len();
        for face in &faces {
            match clusters.assign(store, face) {
                Ok(Assignment::Created { .. }) => report.groups_created += 1,
                Ok(Assignment::Joined { .. }) => {}
                Err(e) => {
                    // Left ungrouped; picked up at the start of the next scan
                    report.fail(&file.path, FailureStage::Persistence, e);
                }
            }
        }

        report
    }

    /// Fold the walk outcome into the report. Unseen files are swept only
    /// when the walk visited every entry and the scan was not cancelled.
    fn finish_walk(
        &self,
        album: &Album,
        walk: &WalkSummary,
        clusters: Option<&FaceClusters>,
        report: &mut ScanReport,
    ) {
        report.discovered = walk.discovered;
        for (path, message) in &walk.failures {
            report.fail(path.clone(), FailureStage::Traversal, message);
        }

        if walk.is_complete() && !report.cancelled {
            self.remove_missing(album, walk, clusters, report);
        } else {
            tracing::info!(album_id = album.id, "Partial walk, keeping records of unseen files");
        }
    }

    /// Remove records of files no longer under the album root.
    fn remove_missing(
        &self,
        album: &Album,
        walk: &WalkSummary,
        clusters: Option<&FaceClusters>,
        report: &mut ScanReport,
    ) {
        let store = self.store.as_ref();
        let stored = match store.list_media(&MediaFilter::album(album.id)) {
            Ok(items) => items,
            Err(e) => {
                report.fail(album.path.clone(), FailureStage::Persistence, e);
                return;
            }
        };

        for item in stored.into_iter().filter(|i| !walk.seen.contains(&i.relative_path)) {
            match store.remove_media(item.id) {
                Ok(removed) => {
                    tracing::debug!(path = %item.path.display(), "Removed missing media");
                    remove_asset_files(&removed.assets);
                    if let Some(clusters) = clusters {
                        if let Err(e) = clusters.forget(&removed.face_ids) {
                            report.fail(item.path.clone(), FailureStage::Persistence, e);
                        }
                    }
                    report.removed += 1;
                }
                Err(e) => report.fail(item.path.clone(), FailureStage::Persistence, e),
            }
        }

        match store.prune_empty_face_groups() {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "Pruned empty face groups"),
            Err(e) => report.fail(album.path.clone(), FailureStage::Persistence, e),
        }
    }
}

fn send(progress_tx: &Option<mpsc::Sender<ScanProgress>>, progress: ScanProgress) {
    if let Some(tx) = progress_tx {
        let _ = tx.send(progress);
    }
}
