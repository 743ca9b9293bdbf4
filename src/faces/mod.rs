pub mod clustering;
pub mod detector;
pub mod processor;

use std::sync::Arc;

use crate::config::FaceConfig;

pub use clustering::{Assignment, FaceClusters, DEFAULT_MATCH_DISTANCE};
pub use detector::{FaceDetector, OnnxFaceDetector, RawDetection};
pub use processor::FaceProcessor;

/// The ONNX detector when face detection is enabled, otherwise None.
pub fn detector_from_config(config: &FaceConfig) -> Option<Arc<dyn FaceDetector>> {
    if !config.enabled {
        return None;
    }
    Some(Arc::new(OnnxFaceDetector::new(config)))
}
