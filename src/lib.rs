//! Photo library ingestion.
//!
//! A scan walks an album directory, classifies each file, derives a
//! thumbnail (and a highres re-encode for formats browsers cannot show),
//! detects faces on the thumbnail and groups them into identities.
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! use photoscan::{Config, MediaStore, Scanner};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let db = Arc::new(photoscan::db::open(&config.db_path)?);
//! let album = db.find_or_create_album("alice", "Holidays", "/srv/photos/holidays".as_ref())?;
//!
//! let scanner = Scanner::from_config(config, db);
//! let report = scanner.scan_album(&album, None, Arc::new(AtomicBool::new(false)))?;
//! println!("{} new, {} failures", report.new, report.failures.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod derive;
pub mod error;
pub mod faces;
pub mod logging;
pub mod scanner;

pub use config::Config;
pub use db::{MediaStore, SqliteDb};
pub use error::{DerivationError, DetectionError, FaceError, StoreError};
pub use scanner::{FailureStage, MediaCategory, ScanFailure, ScanProgress, ScanReport, Scanner};
