//! Names of generated assets.

use std::path::Path;

use crate::db::AssetKind;

/// Name of the `kind` asset generated from a source called `filename`.
///
/// The last extension is dropped and replaced with `.jpg`; a name without
/// an extension keeps all of it as the stem.
///
/// ```
/// use photoscan::db::AssetKind;
/// use photoscan::derive::asset_name;
///
/// assert_eq!(asset_name(AssetKind::Thumbnail, "boy1.jpg"), "thumbnail_boy1.jpg");
/// assert_eq!(asset_name(AssetKind::Highres, "tiff.tiff"), "highres_tiff.jpg");
/// ```
pub fn asset_name(kind: AssetKind, filename: &str) -> String {
    format!("{}_{}.jpg", kind.as_str(), stem(filename))
}

fn stem(filename: &str) -> &str {
    match filename.rfind('.') {
        // A leading dot marks a hidden file, not an extension
        Some(0) | None => filename,
        Some(idx) => &filename[..idx],
    }
}

/// Same-stem JPEG next to `source`, if one exists.
pub fn jpeg_counterpart(source: &Path) -> Option<std::path::PathBuf> {
    let stem = source.file_stem()?;
    let parent = source.parent()?;
    ["jpg", "jpeg", "JPG", "JPEG"]
        .iter()
        .map(|ext| {
            let mut name = stem.to_os_string();
            name.push(".");
            name.push(ext);
            parent.join(name)
        })
        .find(|candidate| candidate != source && candidate.is_file())
}
