use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::config::FaceConfig;
use crate::db::BoundingBox;
use crate::error::DetectionError;

const DETECTION_MODEL_FILE: &str = "ultraface-320.onnx";
const DETECTION_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";
const EMBEDDING_MODEL_FILE: &str = "arcface-resnet100.onnx";
const EMBEDDING_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

/// One face found in an image, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// L2-normalised, fixed dimension for a given detector.
    pub embedding: Vec<f32>,
}

/// Finds faces in a decoded image.
///
/// Implementations must be callable from several scan workers at once.
/// Returning no detections is a valid result, not an error.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectionError>;
}

/// UltraFace detection followed by ArcFace embeddings, run with ONNX Runtime.
///
/// Sessions are created on first use and shared behind a mutex each.
pub struct OnnxFaceDetector {
    models_dir: PathBuf,
    download_models: bool,
    detection: OnceLock<Mutex<Session>>,
    embedding: OnceLock<Mutex<Session>>,
}

impl OnnxFaceDetector {
    pub fn new(config: &FaceConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            download_models: config.download_models,
            detection: OnceLock::new(),
            embedding: OnceLock::new(),
        }
    }

    fn detection_session(&self) -> Result<MutexGuard<'_, Session>, DetectionError> {
        self.session(&self.detection, DETECTION_MODEL_FILE, DETECTION_MODEL_URL)
    }

    fn embedding_session(&self) -> Result<MutexGuard<'_, Session>, DetectionError> {
        self.session(&self.embedding, EMBEDDING_MODEL_FILE, EMBEDDING_MODEL_URL)
    }

    fn session<'a>(
        &self,
        slot: &'a OnceLock<Mutex<Session>>,
        filename: &str,
        url: &str,
    ) -> Result<MutexGuard<'a, Session>, DetectionError> {
        if slot.get().is_none() {
            let session = self
                .load_session(filename, url)
                .map_err(|e| DetectionError::ModelUnavailable(format!("{filename}: {e:#}")))?;
            // A concurrent loader may have won; its session is kept
            let _ = slot.set(Mutex::new(session));
        }

        slot.get()
            .ok_or_else(|| DetectionError::ModelUnavailable(filename.to_string()))?
            .lock()
            .map_err(|_| DetectionError::Inference(format!("{filename} session lock poisoned")))
    }

    fn load_session(&self, filename: &str, url: &str) -> Result<Session> {
        let model_path = ensure_model(&self.models_dir, filename, url, self.download_models)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;
        Ok(session)
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectionError> {
        let face_boxes = {
            let mut session = self.detection_session()?;
            run_ultraface_detection(&mut session, image)
                .map_err(|e| DetectionError::Inference(format!("{e:#}")))?
        };

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let (width, height) = image.dimensions();
        let mut session = self.embedding_session()?;
        let mut detections = Vec::with_capacity(face_boxes.len());

        for (bbox, confidence) in face_boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let face_crop = crop_face(image, &bbox, width, height);
            let embedding = run_arcface_embedding(&mut session, &face_crop)
                .map_err(|e| DetectionError::Inference(format!("{e:#}")))?;

            detections.push(RawDetection {
                bbox,
                confidence,
                embedding,
            });
        }

        Ok(detections)
    }
}

/// Path of a model file, downloading it first if allowed and missing.
fn ensure_model(models_dir: &Path, filename: &str, url: &str, download: bool) -> Result<PathBuf> {
    let model_path = models_dir.join(filename);
    if model_path.exists() {
        return Ok(model_path);
    }
    if !download {
        return Err(anyhow!("model not found at {}", model_path.display()));
    }

    std::fs::create_dir_all(models_dir)?;
    tracing::info!(model = %filename, "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    let partial = models_dir.join(format!("{filename}.part"));
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&partial, &model_path)?;
    tracing::info!(model = %filename, path = ?model_path, "Model downloaded");

    Ok(model_path)
}

/// Run UltraFace detection model
fn run_ultraface_detection(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;
    const CONFIDENCE_THRESHOLD: f32 = 0.7;
    const NMS_THRESHOLD: f32 = 0.3;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let input_data = to_nchw(&resized, 127.0, 128.0);

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT, INPUT_WIDTH],
        input_data.into_boxed_slice(),
    ))?;
    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalised corners
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = BoundingBox {
            x: x1.max(0),
            y: y1.max(0),
            width: (x2 - x1).max(1),
            height: (y2 - y1).max(1),
        };
        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Run ArcFace embedding model; the result is L2-normalised.
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: usize = 112;

    let resized = face_img.resize_exact(
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
        image::imageops::FilterType::Triangle,
    );
    let input_data = to_nchw(&resized, 127.5, 127.5);

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE, INPUT_SIZE],
        input_data.into_boxed_slice(),
    ))?;
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs.iter().next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    let embedding = l2_normalize(embedding_data);
    if embedding.iter().all(|v| *v == 0.0) {
        return Err(anyhow!("embedding model returned a zero vector"));
    }
    Ok(embedding)
}

/// RGB pixels to a planar NCHW buffer, `(value - mean) / scale`.
fn to_nchw(img: &DynamicImage, mean: f32, scale: f32) -> Vec<f32> {
    let rgb = img.to_rgb8();
    let plane = (rgb.width() * rgb.height()) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (idx, pixel) in rgb.pixels().enumerate() {
        for channel in 0..3 {
            data[channel * plane + idx] = (pixel[channel] as f32 - mean) / scale;
        }
    }

    data
}

pub(crate) fn l2_normalize(values: &[f32]) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for (bbox, confidence) in boxes {
        if keep.iter().all(|(kept, _)| compute_iou(kept, &bbox) <= threshold) {
            keep.push((bbox, confidence));
        }
    }

    keep
}

/// Compute Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width * a.height) as f32;
    let area_b = (b.width * b.height) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region with 20% padding, clamped to the image
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn bbox(x: i32, y: i32, width: i32, height: i32) -> BoundingBox {
        BoundingBox { x, y, width, height }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0, 0, 10, 10);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 0.001);
        assert!(compute_iou(&a, &bbox(20, 20, 10, 10)).abs() < 0.001);
        assert!((compute_iou(&a, &bbox(5, 0, 10, 10)) - 1.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_keeps_strongest_overlap() {
        let kept = nms(
            vec![
                (bbox(0, 0, 10, 10), 0.8),
                (bbox(1, 1, 10, 10), 0.95),
                (bbox(50, 50, 10, 10), 0.75),
            ],
            0.3,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, bbox(1, 1, 10, 10));
        assert_eq!(kept[1].0, bbox(50, 50, 10, 10));
    }

    #[test]
    fn test_crop_face_is_clamped() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(100, 80));
        let crop = crop_face(&img, &bbox(90, 70, 30, 30), 100, 80);
        assert!(crop.width() >= 1 && crop.width() <= 100);
        assert!(crop.height() >= 1 && crop.height() <= 80);

        let crop = crop_face(&img, &bbox(40, 30, 10, 10), 100, 80);
        assert_eq!((crop.width(), crop.height()), (14, 14));
    }

    #[test]
    fn test_nchw_layout() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(1, 0, image::Rgb([255, 0, 128]));
        let data = to_nchw(&DynamicImage::ImageRgb8(rgb), 127.5, 127.5);
        assert_eq!(data.len(), 6);
        assert!((data[1] - 1.0).abs() < 0.001);
        assert!((data[3] + 1.0).abs() < 0.001);
        assert!(data[5].abs() < 0.01);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 0.001);
        assert!((v[1] - 0.8).abs() < 0.001);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_model_without_download() {
        let dir = tempdir().unwrap();
        let config = FaceConfig {
            models_dir: dir.path().to_path_buf(),
            download_models: false,
            ..FaceConfig::default()
        };
        let detector = OnnxFaceDetector::new(&config);
        let img = DynamicImage::ImageRgb8(RgbImage::new(32, 32));

        match detector.detect(&img) {
            Err(DetectionError::ModelUnavailable(msg)) => assert!(msg.contains(DETECTION_MODEL_FILE)),
            other => panic!("expected missing model, got {other:?}"),
        }
    }
}
