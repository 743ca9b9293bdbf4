//! Store abstraction consumed by the scan pipeline.
//!
//! The pipeline only talks to persistence through this trait, so a scan can
//! run against any record store. `SqliteDb` is the bundled implementation.

use std::path::Path;

use super::{
    Album, DerivedAsset, DetectedFace, FaceGroup, MediaFilter, MediaItem, MediaUpsert, NewAsset,
    NewFace, NewMediaItem, RemovedDerived,
};
use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

pub trait MediaStore: Send + Sync {
    // === Albums ===

    /// Find the album owned by `owner` at `path`, creating it if absent.
    fn find_or_create_album(&self, owner: &str, title: &str, path: &Path) -> StoreResult<Album>;

    // === Media ===

    /// Insert or refresh the item keyed by (album, relative path).
    ///
    /// When the stored fingerprint differs, the item's assets and faces are
    /// deleted in the same transaction and returned in `removed`.
    fn upsert_media(&self, album_id: i64, item: NewMediaItem) -> StoreResult<MediaUpsert>;

    /// Delete an item together with its assets and faces.
    fn remove_media(&self, media_id: i64) -> StoreResult<RemovedDerived>;

    // === Derived assets ===

    /// Insert an asset, replacing any previous asset of the same kind.
    /// Returns the stored record and the replaced one, if any.
    fn upsert_asset(
        &self,
        media_id: i64,
        asset: NewAsset,
    ) -> StoreResult<(DerivedAsset, Option<DerivedAsset>)>;

    fn assets_for_media(&self, media_id: i64) -> StoreResult<Vec<DerivedAsset>>;

    // === Faces ===

    fn insert_face(&self, media_id: i64, face: NewFace) -> StoreResult<DetectedFace>;

    /// Insert every detection of one item and mark it face-scanned, in one
    /// transaction. An empty `faces` only sets the mark.
    fn record_faces(&self, media_id: i64, faces: Vec<NewFace>) -> StoreResult<Vec<DetectedFace>>;

    fn set_face_group(&self, face_id: i64, group_id: i64) -> StoreResult<()>;

    fn create_face_group(&self, label: &str) -> StoreResult<i64>;

    fn faces_for_media(&self, media_id: i64) -> StoreResult<Vec<DetectedFace>>;

    /// Faces persisted by detection but never assigned to a group.
    fn unassigned_faces(&self) -> StoreResult<Vec<DetectedFace>>;

    /// Delete groups without members. Returns the number removed.
    fn prune_empty_face_groups(&self) -> StoreResult<usize>;

    // === Queries ===

    fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<MediaItem>>;

    fn list_assets(&self, filter: &MediaFilter) -> StoreResult<Vec<DerivedAsset>>;

    fn list_faces(&self, filter: &MediaFilter) -> StoreResult<Vec<DetectedFace>>;

    /// All groups ordered by id, with their member face ids.
    fn list_face_groups(&self) -> StoreResult<Vec<FaceGroup>>;
}
