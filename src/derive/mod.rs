//! Generation of derived images (thumbnails and highres re-encodes).

pub mod decode;
pub mod naming;

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db::{AssetKind, DerivedAsset, MediaItem, NewAsset};
use crate::error::DerivationError;
use crate::scanner::MediaCategory;

pub use decode::{DecodeSource, Decoded, SourceDecoder};
pub use naming::asset_name;

/// Result of generating one asset kind.
#[derive(Debug)]
pub struct DerivationOutcome {
    pub kind: AssetKind,
    pub result: Result<NewAsset, DerivationError>,
}

/// Writes derived images under `<root>/<album id>/<media id>/`.
pub struct DerivationEngine {
    root: PathBuf,
    thumbnail_size: u32,
    thumbnail_quality: u8,
    highres_quality: u8,
    decoder: SourceDecoder,
}

impl DerivationEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.thumbnails.path.clone(),
            thumbnail_size: config.thumbnails.size,
            thumbnail_quality: config.thumbnails.quality,
            highres_quality: config.highres.quality,
            decoder: SourceDecoder::new(&config.converter),
        }
    }

    pub fn asset_dir(&self, item: &MediaItem) -> PathBuf {
        self.root
            .join(item.album_id.to_string())
            .join(item.id.to_string())
    }

    /// Generate the requested kinds for `item`, one outcome per kind.
    ///
    /// The source is decoded at most once; a thumbnail produced alongside a
    /// highres image is scaled from the same decoded pixels.
    pub fn derive(&self, item: &MediaItem, kinds: &[AssetKind]) -> Vec<DerivationOutcome> {
        let mut source: Option<Result<DynamicImage, String>> = None;
        let mut outcomes = Vec::with_capacity(kinds.len());

        for &kind in kinds {
            let decoded = source.get_or_insert_with(|| {
                self.decoder
                    .decode(&item.path)
                    .map(|d| d.image)
                    .map_err(|e| e.to_string())
            });

            let result = match kind {
                AssetKind::Highres => match decoded {
                    Ok(image) => self.write_asset(item, kind, image, self.highres_quality),
                    Err(reason) => Err(decode_error(&item.path, reason)),
                },
                AssetKind::Thumbnail => match decoded {
                    Ok(image) => self.write_thumbnail(item, image),
                    Err(reason) => self.thumbnail_from_counterpart(item, reason),
                },
            };

            if let Err(ref e) = result {
                tracing::warn!(path = %item.path.display(), %kind, error = %e, "Derivation failed");
            }
            outcomes.push(DerivationOutcome { kind, result });
        }

        outcomes
    }

    fn thumbnail_from_counterpart(
        &self,
        item: &MediaItem,
        reason: &str,
    ) -> Result<NewAsset, DerivationError> {
        if item.category != MediaCategory::HighResImage {
            return Err(decode_error(&item.path, reason));
        }
        match self.decoder.decode_counterpart(&item.path) {
            Some(decoded) => self.write_thumbnail(item, &decoded?.image),
            None => Err(decode_error(&item.path, reason)),
        }
    }

    fn write_thumbnail(&self, item: &MediaItem, image: &DynamicImage) -> Result<NewAsset, DerivationError> {
        let size = self.thumbnail_size;
        if image.width() > size || image.height() > size {
            let thumbnail = image.thumbnail(size, size);
            self.write_asset(item, AssetKind::Thumbnail, &thumbnail, self.thumbnail_quality)
        } else {
            self.write_asset(item, AssetKind::Thumbnail, image, self.thumbnail_quality)
        }
    }

    /// Encode `image` as JPEG into a temporary file and rename it into place.
    fn write_asset(
        &self,
        item: &MediaItem,
        kind: AssetKind,
        image: &DynamicImage,
        quality: u8,
    ) -> Result<NewAsset, DerivationError> {
        let dir = self.asset_dir(item);
        fs::create_dir_all(&dir)?;

        let name = asset_name(kind, &item.title);
        let path = dir.join(&name);
        let tmp_path = dir.join(format!(".{name}.tmp"));

        let written = encode_jpeg(&tmp_path, kind, image, quality).and_then(|()| {
            fs::rename(&tmp_path, &path)?;
            Ok(())
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        tracing::debug!(path = %path.display(), %kind, "Wrote derived asset");
        Ok(NewAsset {
            kind,
            name,
            path,
            width: image.width(),
            height: image.height(),
        })
    }
}

fn encode_jpeg(
    path: &Path,
    kind: AssetKind,
    image: &DynamicImage,
    quality: u8,
) -> Result<(), DerivationError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|source| DerivationError::Encode { kind, source })?;
    writer.flush()?;
    Ok(())
}

fn decode_error(path: &Path, reason: &str) -> DerivationError {
    DerivationError::Decode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Delete the files behind `assets`, then their media directories if empty.
pub fn remove_asset_files(assets: &[DerivedAsset]) {
    for asset in assets {
        match fs::remove_file(&asset.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %asset.path.display(), error = %e, "Failed to delete asset file");
            }
        }
        if let Some(dir) = asset.path.parent() {
            // Fails while other assets remain, which is fine
            let _ = fs::remove_dir(dir);
        }
    }
}
