use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub highres: HighresConfig,

    #[serde(default)]
    pub converter: ConverterConfig,

    #[serde(default)]
    pub faces: FaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Worker threads for the per-file pipeline. 0 uses the available parallelism.
    #[serde(default)]
    pub workers: usize,

    /// Maximum number of discovered files waiting for a worker.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    256
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: default_queue_depth(),
        }
    }
}

impl ScannerConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    /// Root directory for every derived asset (thumbnails and highres).
    #[serde(default = "default_media_cache_path")]
    pub path: PathBuf,

    /// Longest side of a thumbnail, in pixels.
    #[serde(default = "default_thumb_size")]
    pub size: u32,

    #[serde(default = "default_thumb_quality")]
    pub quality: u8,
}

fn default_media_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("photoscan/media")
}

fn default_thumb_size() -> u32 {
    1024
}

fn default_thumb_quality() -> u8 {
    70
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_media_cache_path(),
            size: default_thumb_size(),
            quality: default_thumb_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighresConfig {
    #[serde(default = "default_highres_quality")]
    pub quality: u8,
}

fn default_highres_quality() -> u8 {
    95
}

impl Default for HighresConfig {
    fn default() -> Self {
        Self {
            quality: default_highres_quality(),
        }
    }
}

/// External command used for formats the built-in decoders cannot read
/// (HEIF, JPEG 2000, camera raw).
///
/// `{input}` and `{output}` in `args` are replaced with the source path and
/// a PNG destination path, e.g. `program = "magick"`, `args = ["{input}", "{output}"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default)]
    pub program: Option<PathBuf>,

    #[serde(default = "default_converter_args")]
    pub args: Vec<String>,
}

fn default_converter_args() -> Vec<String> {
    vec!["{input}".to_string(), "{output}".to_string()]
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_converter_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    #[serde(default = "default_faces_enabled")]
    pub enabled: bool,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Fetch missing ONNX models on first use.
    #[serde(default = "default_download_models")]
    pub download_models: bool,

    /// Cosine distance below which a face joins an existing group.
    #[serde(default = "default_match_distance")]
    pub match_distance: f32,
}

fn default_faces_enabled() -> bool {
    true
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("photoscan")
        .join("models")
}

fn default_download_models() -> bool {
    true
}

fn default_match_distance() -> f32 {
    crate::faces::clustering::DEFAULT_MATCH_DISTANCE
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            enabled: default_faces_enabled(),
            models_dir: default_models_dir(),
            download_models: default_download_models(),
            match_distance: default_match_distance(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoscan")
        .join("photoscan.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scanner: ScannerConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            highres: HighresConfig::default(),
            converter: ConverterConfig::default(),
            faces: FaceConfig::default(),
        }
    }
}

impl Config {
    /// Load from `$PHOTOSCAN_CONFIG` or the default location, writing defaults
    /// there if no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photoscan")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOSCAN_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
