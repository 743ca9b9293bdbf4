//! Error types at component boundaries.
//!
//! Orchestration code works in `anyhow::Result`; these enums exist where a
//! caller has to tell failure kinds apart (which stage failed, whether the
//! file's pipeline can continue).

use std::path::PathBuf;
use thiserror::Error;

use crate::db::AssetKind;

/// The store rejected a read or write.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Generating one derived asset failed. Other kinds for the same item are
/// unaffected.
#[derive(Error, Debug)]
pub enum DerivationError {
    #[error("no decoder could read {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("encoding {kind} failed: {source}")]
    Encode {
        kind: AssetKind,
        #[source]
        source: image::ImageError,
    },
    #[error("converter {program} failed: {reason}")]
    Converter { program: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The face detection capability is unavailable or failed on an image.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("could not load thumbnail: {0}")]
    Image(#[from] image::ImageError),
}

/// The face pipeline for one media item failed.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
