use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::{tempdir, TempDir};

use photoscan::config::ConverterConfig;
use photoscan::db::{
    Album, AssetKind, BoundingBox, DerivedAsset, DetectedFace, FaceGroup, MediaFilter, MediaItem,
    MediaStore, MediaUpsert, NewAsset, NewFace, NewMediaItem, RemovedDerived, SqliteDb,
    StoreResult,
};
use photoscan::error::{DetectionError, StoreError};
use photoscan::faces::{FaceDetector, RawDetection};
use photoscan::{Config, FailureStage, MediaCategory, ScanReport, Scanner};

/// Treats any strongly coloured image as one face whose embedding is the
/// mean colour. Grey images have no face.
#[derive(Default)]
struct MeanColorDetector {
    calls: AtomicUsize,
}

impl FaceDetector for MeanColorDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let rgb = image.to_rgb8();
        let pixels = (rgb.width() * rgb.height()).max(1) as f32;
        let mut mean = [0f32; 3];
        for pixel in rgb.pixels() {
            for (m, c) in mean.iter_mut().zip(pixel.0) {
                *m += c as f32;
            }
        }
        for m in &mut mean {
            *m /= pixels;
        }

        let max = mean.iter().cloned().fold(f32::MIN, f32::max);
        let min = mean.iter().cloned().fold(f32::MAX, f32::min);
        if max - min < 40.0 {
            return Ok(Vec::new());
        }

        Ok(vec![RawDetection {
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: rgb.width() as i32,
                height: rgb.height() as i32,
            },
            confidence: 0.99,
            embedding: mean.to_vec(),
        }])
    }
}

/// Fails every detection.
#[derive(Default)]
struct BrokenDetector {
    calls: AtomicUsize,
}

impl FaceDetector for BrokenDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DetectionError::Inference("output tensor has the wrong shape".to_string()))
    }
}

/// Store that refuses to record one asset name and passes everything else
/// through to SQLite.
struct RejectingAssetStore {
    inner: Arc<SqliteDb>,
    rejected: String,
}

impl MediaStore for RejectingAssetStore {
    fn find_or_create_album(&self, owner: &str, title: &str, path: &Path) -> StoreResult<Album> {
        self.inner.find_or_create_album(owner, title, path)
    }

    fn upsert_media(&self, album_id: i64, item: NewMediaItem) -> StoreResult<MediaUpsert> {
        self.inner.upsert_media(album_id, item)
    }

    fn remove_media(&self, media_id: i64) -> StoreResult<RemovedDerived> {
        self.inner.remove_media(media_id)
    }

    fn upsert_asset(
        &self,
        media_id: i64,
        asset: NewAsset,
    ) -> StoreResult<(DerivedAsset, Option<DerivedAsset>)> {
        if asset.name == self.rejected {
            return Err(StoreError::Poisoned);
        }
        self.inner.upsert_asset(media_id, asset)
    }

    fn assets_for_media(&self, media_id: i64) -> StoreResult<Vec<DerivedAsset>> {
        self.inner.assets_for_media(media_id)
    }

    fn insert_face(&self, media_id: i64, face: NewFace) -> StoreResult<DetectedFace> {
        self.inner.insert_face(media_id, face)
    }

    fn record_faces(&self, media_id: i64, faces: Vec<NewFace>) -> StoreResult<Vec<DetectedFace>> {
        self.inner.record_faces(media_id, faces)
    }

    fn set_face_group(&self, face_id: i64, group_id: i64) -> StoreResult<()> {
        self.inner.set_face_group(face_id, group_id)
    }

    fn create_face_group(&self, label: &str) -> StoreResult<i64> {
        self.inner.create_face_group(label)
    }

    fn faces_for_media(&self, media_id: i64) -> StoreResult<Vec<DetectedFace>> {
        self.inner.faces_for_media(media_id)
    }

    fn unassigned_faces(&self) -> StoreResult<Vec<DetectedFace>> {
        self.inner.unassigned_faces()
    }

    fn prune_empty_face_groups(&self) -> StoreResult<usize> {
        self.inner.prune_empty_face_groups()
    }

    fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<MediaItem>> {
        self.inner.list_media(filter)
    }

    fn list_assets(&self, filter: &MediaFilter) -> StoreResult<Vec<DerivedAsset>> {
        self.inner.list_assets(filter)
    }

    fn list_faces(&self, filter: &MediaFilter) -> StoreResult<Vec<DetectedFace>> {
        self.inner.list_faces(filter)
    }

    fn list_face_groups(&self) -> StoreResult<Vec<FaceGroup>> {
        self.inner.list_face_groups()
    }
}

struct Library {
    photos: TempDir,
    cache: TempDir,
    config: Config,
    db: Arc<SqliteDb>,
    album: Album,
    detector: Arc<MeanColorDetector>,
    scanner: Scanner,
}

impl Library {
    fn new() -> Self {
        let photos = tempdir().unwrap();
        let cache = tempdir().unwrap();

        let mut config = Config::default();
        config.db_path = cache.path().join("library.db");
        config.thumbnails.path = cache.path().join("assets");
        config.thumbnails.size = 32;
        config.scanner.workers = 4;
        config.scanner.queue_depth = 3;

        let db = Arc::new(photoscan::db::open(&config.db_path).unwrap());
        let album = db
            .find_or_create_album("alice", "Family", photos.path())
            .unwrap();

        let detector = Arc::new(MeanColorDetector::default());
        let scanner = Scanner::new(
            config.clone(),
            db.clone(),
            Some(detector.clone() as Arc<dyn FaceDetector>),
        );

        Self {
            photos,
            cache,
            config,
            db,
            album,
            detector,
            scanner,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.photos.path().join(name)
    }

    fn solid(&self, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(64, 48, Rgb(color))
            .save(self.path(name))
            .unwrap();
    }

    fn scan(&self) -> ScanReport {
        self.scan_with(&self.scanner)
    }

    fn scan_with(&self, scanner: &Scanner) -> ScanReport {
        scanner
            .scan_album(&self.album, None, Arc::new(AtomicBool::new(false)))
            .unwrap()
    }

    fn media(&self, title: &str) -> MediaItem {
        self.db
            .list_media(&MediaFilter::album(self.album.id).with_title(title))
            .unwrap()
            .remove(0)
    }

    fn asset_names(&self, title: &str) -> Vec<String> {
        let mut names: Vec<_> = self
            .db
            .assets_for_media(self.media(title).id)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        names.sort();
        names
    }

    /// Face group of every media item that has a face, by title.
    fn groups_by_title(&self) -> HashMap<String, i64> {
        let titles: HashMap<i64, String> = self
            .db
            .list_media(&MediaFilter::album(self.album.id))
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.title))
            .collect();

        self.db
            .list_faces(&MediaFilter::album(self.album.id))
            .unwrap()
            .into_iter()
            .map(|f| (titles[&f.media_id].clone(), f.group_id.expect("face left ungrouped")))
            .collect()
    }
}

fn grey_pattern_jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = ((x * 7 + y * 13) % 256) as u8;
        Rgb([v, v, v])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}

fn touch_later(path: &Path) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

fn populate(lib: &Library) {
    lib.solid("boy1.jpg", [210, 30, 25]);
    lib.solid("boy2.png", [190, 45, 40]);
    lib.solid("girl_black_hair2.jpg", [20, 30, 220]);
    lib.solid("blond1.jpg", [40, 200, 50]);
    fs::create_dir(lib.path("summer")).unwrap();
    lib.solid("summer/blond2.jpg", [55, 190, 45]);
    lib.solid("summer/blond3.png", [35, 210, 70]);
    lib.solid("landscape.jpg", [128, 128, 128]);
    lib.solid("tiff.tiff", [128, 128, 128]);

    let jpeg = grey_pattern_jpeg(256, 256);
    fs::write(lib.path("truncated.jpg"), &jpeg[..jpeg.len() * 6 / 10]).unwrap();
    // Baseline greyscale JPEG with restart interval 4; one restart marker is
    // misnumbered and another overwritten with a stray marker byte
    fs::write(
        lib.path("restart_damaged.jpg"),
        include_bytes!("fixtures/restart_damaged.jpg"),
    )
    .unwrap();

    fs::write(lib.path("mp4.mp4"), b"\x00\x00\x00\x18ftypmp42").unwrap();
    fs::write(lib.path("notes.txt"), b"not media").unwrap();
}

#[test]
fn test_full_scan() {
    let lib = Library::new();
    populate(&lib);

    let report = lib.scan();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(!report.cancelled);
    assert_eq!(report.discovered, 11);
    assert_eq!(report.new, 11);
    // Ten thumbnails plus the highres of the TIFF
    assert_eq!(report.assets_generated, 11);
    assert_eq!(report.faces_detected, 6);
    assert_eq!(report.groups_created, 3);

    let media = lib.db.list_media(&MediaFilter::album(lib.album.id)).unwrap();
    assert_eq!(media.len(), 11);
    assert!(media.iter().all(|m| m.title != "notes.txt"));
    let blond2 = media.iter().find(|m| m.title == "blond2.jpg").unwrap();
    assert_eq!(blond2.relative_path, "summer/blond2.jpg");

    let video = media.iter().find(|m| m.title == "mp4.mp4").unwrap();
    assert_eq!(video.category, MediaCategory::UnsupportedVideo);
    assert!(lib.db.assets_for_media(video.id).unwrap().is_empty());

    let tiff = media.iter().find(|m| m.title == "tiff.tiff").unwrap();
    let mut names: Vec<_> = lib
        .db
        .assets_for_media(tiff.id)
        .unwrap()
        .into_iter()
        .map(|a| {
            assert!(a.path.is_file());
            a.name
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["highres_tiff.jpg", "thumbnail_tiff.jpg"]);

    let truncated = media.iter().find(|m| m.title == "truncated.jpg").unwrap();
    let assets = lib.db.assets_for_media(truncated.id).unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].kind, AssetKind::Thumbnail);
    assert_eq!(assets[0].name, "thumbnail_truncated.jpg");
    assert!(assets[0].width <= 32 && assets[0].height <= 32);

    let damaged = media.iter().find(|m| m.title == "restart_damaged.jpg").unwrap();
    let assets = lib.db.assets_for_media(damaged.id).unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].name, "thumbnail_restart_damaged.jpg");
    assert_eq!((assets[0].width, assets[0].height), (32, 32));
    assert!(assets[0].path.is_file());

    let groups = lib.groups_by_title();
    assert_eq!(groups.len(), 6);
    assert_eq!(groups["boy1.jpg"], groups["boy2.png"]);
    assert_eq!(groups["blond1.jpg"], groups["blond2.jpg"]);
    assert_eq!(groups["blond1.jpg"], groups["blond3.png"]);
    assert_ne!(groups["boy1.jpg"], groups["girl_black_hair2.jpg"]);
    assert_ne!(groups["boy1.jpg"], groups["blond1.jpg"]);
    assert_ne!(groups["girl_black_hair2.jpg"], groups["blond1.jpg"]);

    let stored_groups = lib.db.list_face_groups().unwrap();
    assert_eq!(stored_groups.len(), 3);
    let mut labels: Vec<_> = stored_groups.iter().map(|g| g.label.as_str()).collect();
    labels.sort();
    assert_eq!(labels, vec!["Person 1", "Person 2", "Person 3"]);
}

#[test]
fn test_rescan_is_idempotent() {
    let lib = Library::new();
    populate(&lib);
    lib.scan();

    let media = lib.db.list_media(&MediaFilter::album(lib.album.id)).unwrap();
    let assets = lib.db.list_assets(&MediaFilter::album(lib.album.id)).unwrap();
    let groups = lib.groups_by_title();
    let calls = lib.detector.calls.load(Ordering::SeqCst);

    let report = lib.scan();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.new, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 11);
    assert_eq!(report.removed, 0);
    assert_eq!(report.assets_generated, 0);
    assert_eq!(report.faces_detected, 0);
    assert_eq!(report.groups_created, 0);

    assert_eq!(lib.detector.calls.load(Ordering::SeqCst), calls);
    assert_eq!(lib.db.list_media(&MediaFilter::album(lib.album.id)).unwrap(), media);
    assert_eq!(lib.db.list_assets(&MediaFilter::album(lib.album.id)).unwrap(), assets);
    assert_eq!(lib.groups_by_title(), groups);
}

#[test]
fn test_removed_files_are_swept() {
    let lib = Library::new();
    populate(&lib);
    lib.scan();

    let boy2 = lib
        .db
        .list_media(&MediaFilter::album(lib.album.id).with_title("boy2.png"))
        .unwrap()
        .remove(0);
    let boy2_assets = lib.db.assets_for_media(boy2.id).unwrap();
    let boy_group = lib.groups_by_title()["boy1.jpg"];

    fs::remove_file(lib.path("boy2.png")).unwrap();
    fs::remove_file(lib.path("girl_black_hair2.jpg")).unwrap();

    let report = lib.scan();
    assert_eq!(report.removed, 2);
    assert_eq!(report.unchanged, 9);
    assert!(boy2_assets.iter().all(|a| !a.path.exists()));

    let groups = lib.groups_by_title();
    assert_eq!(groups.len(), 4);
    assert_eq!(groups["boy1.jpg"], boy_group);
    assert!(!groups.contains_key("girl_black_hair2.jpg"));

    // The girl's group lost its only member
    let stored_groups = lib.db.list_face_groups().unwrap();
    assert_eq!(stored_groups.len(), 2);
    let boy = stored_groups.iter().find(|g| g.id == boy_group).unwrap();
    assert_eq!(boy.member_ids.len(), 1);
}

#[test]
fn test_changed_file_is_reprocessed() {
    let lib = Library::new();
    populate(&lib);
    lib.scan();

    let before = lib.groups_by_title();
    let blond1 = lib
        .db
        .list_media(&MediaFilter::album(lib.album.id).with_title("blond1.jpg"))
        .unwrap()
        .remove(0);
    let old_thumbnail = lib.db.assets_for_media(blond1.id).unwrap().remove(0);

    RgbImage::from_pixel(80, 40, Rgb([25, 35, 215]))
        .save(lib.path("blond1.jpg"))
        .unwrap();
    touch_later(&lib.path("blond1.jpg"));

    let report = lib.scan();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.updated, 1);
    assert_eq!(report.assets_generated, 1);
    assert_eq!(report.faces_detected, 1);
    assert_eq!(report.groups_created, 0);

    let thumbnail = lib.db.assets_for_media(blond1.id).unwrap().remove(0);
    assert_eq!(thumbnail.name, "thumbnail_blond1.jpg");
    assert_eq!((thumbnail.width, thumbnail.height), (32, 16));
    assert_ne!((thumbnail.width, thumbnail.height), (old_thumbnail.width, old_thumbnail.height));

    let after = lib.groups_by_title();
    assert_eq!(after["blond1.jpg"], before["girl_black_hair2.jpg"]);
    assert_eq!(after["blond2.jpg"], before["blond2.jpg"]);
    assert_eq!(lib.db.list_face_groups().unwrap().len(), 3);
}

#[test]
fn test_scan_without_detector_skips_faces() {
    let photos = tempdir().unwrap();
    let cache = tempdir().unwrap();
    let mut config = Config::default();
    config.thumbnails.path = cache.path().to_path_buf();

    let db = Arc::new(SqliteDb::open_in_memory().unwrap());
    db.initialize().unwrap();
    let album = db.find_or_create_album("bob", "Misc", photos.path()).unwrap();
    RgbImage::from_pixel(16, 16, Rgb([210, 30, 25]))
        .save(photos.path().join("boy1.jpg"))
        .unwrap();

    let scanner = Scanner::new(config, db.clone(), None);
    let report = scanner
        .scan_album(&album, None, Arc::new(AtomicBool::new(false)))
        .unwrap();

    assert_eq!(report.assets_generated, 1);
    assert_eq!(report.faces_detected, 0);
    let media = db.list_media(&MediaFilter::album(album.id)).unwrap();
    assert!(media[0].faces_scanned_at.is_none());
}

#[cfg(unix)]
#[test]
fn test_converter_derives_high_resolution_formats() {
    let lib = Library::new();
    let reference = lib.cache.path().join("converted.png");
    RgbImage::from_pixel(96, 64, Rgb([128, 128, 128]))
        .save(&reference)
        .unwrap();
    fs::write(lib.path("heif.heif"), b"\x00\x00\x00\x18ftypheic not really").unwrap();
    fs::write(lib.path("jpg2000.jp2"), b"\x00\x00\x00\x0cjP  not really").unwrap();

    let mut config = lib.config.clone();
    config.converter = ConverterConfig {
        program: Some("sh".into()),
        args: vec![
            "-c".into(),
            format!("test -f \"$1\" && cp '{}' \"$0\"", reference.display()),
            "{output}".into(),
            "{input}".into(),
        ],
    };
    let scanner = Scanner::new(config, lib.db.clone(), None);

    let report = lib.scan_with(&scanner);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.new, 2);
    assert_eq!(report.assets_generated, 4);

    assert_eq!(lib.asset_names("heif.heif"), vec!["highres_heif.jpg", "thumbnail_heif.jpg"]);
    assert_eq!(
        lib.asset_names("jpg2000.jp2"),
        vec!["highres_jpg2000.jpg", "thumbnail_jpg2000.jpg"]
    );

    for asset in lib.db.list_assets(&MediaFilter::album(lib.album.id)).unwrap() {
        assert!(asset.path.is_file());
        match asset.kind {
            AssetKind::Highres => assert_eq!((asset.width, asset.height), (96, 64)),
            AssetKind::Thumbnail => assert!(asset.width <= 32 && asset.height <= 32),
        }
    }
}

#[test]
fn test_asset_store_failure_is_isolated() {
    let lib = Library::new();
    lib.solid("boy1.jpg", [210, 30, 25]);
    lib.solid("boy2.png", [190, 45, 40]);
    lib.solid("landscape.jpg", [128, 128, 128]);

    let store = Arc::new(RejectingAssetStore {
        inner: lib.db.clone(),
        rejected: "thumbnail_boy2.jpg".to_string(),
    });
    let scanner = Scanner::new(
        lib.config.clone(),
        store,
        Some(lib.detector.clone() as Arc<dyn FaceDetector>),
    );

    let report = lib.scan_with(&scanner);
    assert_eq!(report.new, 3);
    assert_eq!(report.assets_generated, 2);
    let failures: Vec<_> = report.failures_at(FailureStage::Persistence).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, lib.path("boy2.png"));
    assert_eq!(report.failures.len(), 1);

    let boy2 = lib.media("boy2.png");
    assert!(lib.asset_names("boy2.png").is_empty());
    assert!(boy2.faces_scanned_at.is_none());
    assert!(!lib
        .cache
        .path()
        .join("assets")
        .join(boy2.album_id.to_string())
        .join(boy2.id.to_string())
        .join("thumbnail_boy2.jpg")
        .exists());
    assert_eq!(lib.asset_names("boy1.jpg"), vec!["thumbnail_boy1.jpg"]);
    assert_eq!(lib.asset_names("landscape.jpg"), vec!["thumbnail_landscape.jpg"]);
    assert!(lib.media("boy1.jpg").faces_scanned_at.is_some());

    let report = lib.scan();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.assets_generated, 1);
    assert_eq!(report.faces_detected, 1);
    assert_eq!(lib.asset_names("boy2.png"), vec!["thumbnail_boy2.jpg"]);
    let groups = lib.groups_by_title();
    assert_eq!(groups["boy1.jpg"], groups["boy2.png"]);
}

#[test]
fn test_detection_failure_is_retried() {
    let lib = Library::new();
    lib.solid("boy1.jpg", [210, 30, 25]);

    let detector = Arc::new(BrokenDetector::default());
    let scanner = Scanner::new(
        lib.config.clone(),
        lib.db.clone(),
        Some(detector.clone() as Arc<dyn FaceDetector>),
    );

    let report = lib.scan_with(&scanner);
    assert_eq!(report.failures_at(FailureStage::Detection).count(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.assets_generated, 1);
    assert_eq!(report.faces_detected, 0);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

    let boy1 = lib.media("boy1.jpg");
    assert!(boy1.faces_scanned_at.is_none());
    assert_eq!(lib.asset_names("boy1.jpg"), vec!["thumbnail_boy1.jpg"]);
    assert!(lib.db.faces_for_media(boy1.id).unwrap().is_empty());

    // Assets are kept, detection runs again
    let report = lib.scan_with(&scanner);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.assets_generated, 0);
    assert_eq!(report.failures_at(FailureStage::Detection).count(), 1);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 2);

    let report = lib.scan();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.assets_generated, 0);
    assert_eq!(report.faces_detected, 1);
    assert_eq!(report.groups_created, 1);
    assert!(lib.media("boy1.jpg").faces_scanned_at.is_some());
}
