use std::sync::Arc;

use super::detector::FaceDetector;
use crate::db::{DerivedAsset, DetectedFace, MediaItem, MediaStore, NewFace};
use crate::error::{DetectionError, FaceError};

/// Runs a detector over thumbnails and records what it finds.
pub struct FaceProcessor {
    detector: Arc<dyn FaceDetector>,
}

impl FaceProcessor {
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self { detector }
    }

    /// Detect faces in `thumbnail` and store them for `item`, ungrouped.
    ///
    /// On success the item is marked face-scanned, even with zero faces.
    /// On failure nothing is stored and the item stays unmarked.
    pub fn process_thumbnail(
        &self,
        store: &dyn MediaStore,
        item: &MediaItem,
        thumbnail: &DerivedAsset,
    ) -> Result<Vec<DetectedFace>, FaceError> {
        let image = image::open(&thumbnail.path).map_err(DetectionError::from)?;
        let detections = self.detector.detect(&image)?;

        let faces: Vec<NewFace> = detections
            .into_iter()
            .filter(|d| {
                let usable = !d.embedding.is_empty() && d.bbox.width > 0 && d.bbox.height > 0;
                if !usable {
                    tracing::warn!(path = %item.path.display(), "Dropping detection without embedding or area");
                }
                usable
            })
            .map(|d| NewFace {
                bbox: d.bbox,
                embedding: d.embedding,
                confidence: d.confidence,
            })
            .collect();

        let stored = store.record_faces(item.id, faces)?;
        if !stored.is_empty() {
            tracing::debug!(path = %item.path.display(), count = stored.len(), "Found faces");
        }
        Ok(stored)
    }
}
