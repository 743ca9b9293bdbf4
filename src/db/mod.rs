mod schema;
pub mod albums;
pub mod backend;
pub mod faces;
pub mod media;
pub mod sqlite;

use anyhow::Result;
use std::path::Path;

pub use albums::Album;
pub use backend::{MediaStore, StoreResult};
pub use faces::{BoundingBox, DetectedFace, FaceGroup, NewFace};
pub use media::{
    AssetKind, DerivedAsset, MediaFilter, MediaItem, MediaUpsert, NewAsset, NewMediaItem,
    RemovedDerived, UpsertOutcome,
};
pub use schema::{MIGRATIONS, SCHEMA};
pub use sqlite::SqliteDb;

/// Open the SQLite store at `path` and bring its schema up to date.
pub fn open(path: &Path) -> Result<SqliteDb> {
    let db = SqliteDb::open(path)?;
    db.initialize()?;
    Ok(db)
}
