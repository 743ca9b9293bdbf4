//! Decoder chain for source files.
//!
//! The image crate's decoders are tried first. They already recover
//! damaged JPEG streams (bad restart markers, truncated scans) by filling
//! the undecodable remainder. Formats they cannot read go through an
//! optional external converter.

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use super::naming::jpeg_counterpart;
use crate::config::ConverterConfig;
use crate::error::DerivationError;

static CONVERTER_RUNS: AtomicU64 = AtomicU64::new(0);

/// Which step of the chain produced an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSource {
    Native,
    Converter,
    Counterpart,
}

#[derive(Debug)]
pub struct Decoded {
    pub image: DynamicImage,
    pub source: DecodeSource,
}

type DecoderFn = fn(&[u8]) -> Result<DynamicImage>;

pub struct SourceDecoder {
    converter: Option<ConverterConfig>,
}

impl SourceDecoder {
    pub fn new(converter: &ConverterConfig) -> Self {
        Self {
            converter: converter.program.is_some().then(|| converter.clone()),
        }
    }

    /// Decode `path` at full resolution with EXIF orientation applied.
    pub fn decode(&self, path: &Path) -> Result<Decoded, DerivationError> {
        let bytes = std::fs::read(path)?;
        let mut reasons = Vec::new();

        match decode_bytes(&bytes) {
            Ok(image) => {
                return Ok(Decoded {
                    image: apply_orientation(image, read_exif_orientation(path)),
                    source: DecodeSource::Native,
                });
            }
            Err(e) => reasons.push(format!("{e:#}")),
        }

        if let Some(ref converter) = self.converter {
            match run_converter(converter, path) {
                Ok(image) => {
                    return Ok(Decoded {
                        image: apply_orientation(image, read_exif_orientation(path)),
                        source: DecodeSource::Converter,
                    });
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Converter failed");
                    reasons.push(e.to_string());
                }
            }
        }

        Err(DerivationError::Decode {
            path: path.to_path_buf(),
            reason: reasons.join("; "),
        })
    }

    /// Decode the same-stem JPEG next to `path`, if there is one.
    pub fn decode_counterpart(&self, path: &Path) -> Option<Result<Decoded, DerivationError>> {
        let counterpart = jpeg_counterpart(path)?;
        tracing::debug!(
            path = %path.display(),
            counterpart = %counterpart.display(),
            "Using JPEG counterpart"
        );

        let result = std::fs::read(&counterpart)
            .map_err(DerivationError::from)
            .and_then(|bytes| {
                decode_bytes(&bytes).map_err(|e| DerivationError::Decode {
                    path: counterpart.clone(),
                    reason: format!("{e:#}"),
                })
            })
            .map(|image| Decoded {
                image: apply_orientation(image, read_exif_orientation(&counterpart)),
                source: DecodeSource::Counterpart,
            });
        Some(result)
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    let decoders: Vec<DecoderFn> = vec![image_crate_decoder];

    let mut reasons = Vec::new();
    for decoder in decoders {
        match decoder(bytes) {
            Ok(image) => return Ok(image),
            Err(e) => reasons.push(format!("{e:#}")),
        }
    }

    bail!("all decoders failed: {}", reasons.join("; "))
}

fn image_crate_decoder(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("image crate failed to decode")
}

fn run_converter(converter: &ConverterConfig, input: &Path) -> Result<DynamicImage, DerivationError> {
    let program = converter
        .program
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let output = converter_output_path();

    let args: Vec<String> = converter
        .args
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        })
        .collect();

    let result = Command::new(&program)
        .args(&args)
        .output()
        .map_err(|e| DerivationError::Converter {
            program: program.clone(),
            reason: e.to_string(),
        })
        .and_then(|out| {
            if out.status.success() {
                image::open(&output).map_err(|e| DerivationError::Converter {
                    program: program.clone(),
                    reason: format!("unreadable output: {e}"),
                })
            } else {
                Err(DerivationError::Converter {
                    program: program.clone(),
                    reason: format!(
                        "{}: {}",
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    ),
                })
            }
        });

    let _ = std::fs::remove_file(&output);
    result
}

fn converter_output_path() -> PathBuf {
    let run = CONVERTER_RUNS.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("photoscan-{}-{}.png", std::process::id(), run))
}

/// Read the EXIF orientation tag (1-8) from a file; 1 when absent.
fn read_exif_orientation(path: &Path) -> u32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 1,
    };

    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(_) => return 1,
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
