//! SQLite backend implementation.

use anyhow::Result;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::backend::{MediaStore, StoreResult};
use super::faces::{bytes_to_embedding, embedding_to_bytes};
use super::schema::{MIGRATIONS, SCHEMA};
use super::{
    Album, AssetKind, BoundingBox, DerivedAsset, DetectedFace, FaceGroup, MediaFilter, MediaItem,
    MediaUpsert, NewAsset, NewFace, NewMediaItem, RemovedDerived, UpsertOutcome,
};
use crate::error::StoreError;
use crate::scanner::MediaCategory;

const MEDIA_COLUMNS: &str =
    "m.id, m.album_id, m.title, m.relative_path, m.path, m.category, m.fingerprint, m.faces_scanned_at";
const ASSET_COLUMNS: &str = "a.id, a.media_id, a.kind, a.name, a.path, a.width, a.height";
const FACE_COLUMNS: &str =
    "f.id, f.media_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, f.embedding, f.confidence, f.group_id";

/// One connection shared by all scan workers. Statements are short, so a
/// mutex is enough; image work happens outside the lock.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaItem> {
    let category: String = row.get(5)?;
    let category = MediaCategory::parse(&category)
        .ok_or_else(|| conversion_error(5, format!("unknown media category {category}")))?;
    Ok(MediaItem {
        id: row.get(0)?,
        album_id: row.get(1)?,
        title: row.get(2)?,
        relative_path: row.get(3)?,
        path: PathBuf::from(row.get::<_, String>(4)?),
        category,
        fingerprint: row.get(6)?,
        faces_scanned_at: row.get(7)?,
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<DerivedAsset> {
    let kind: String = row.get(2)?;
    let kind = AssetKind::parse(&kind)
        .ok_or_else(|| conversion_error(2, format!("unknown asset kind {kind}")))?;
    Ok(DerivedAsset {
        id: row.get(0)?,
        media_id: row.get(1)?,
        kind,
        name: row.get(3)?,
        path: PathBuf::from(row.get::<_, String>(4)?),
        width: row.get(5)?,
        height: row.get(6)?,
    })
}

fn face_from_row(row: &Row<'_>) -> rusqlite::Result<DetectedFace> {
    let embedding: Vec<u8> = row.get(6)?;
    Ok(DetectedFace {
        id: row.get(0)?,
        media_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        embedding: bytes_to_embedding(&embedding),
        confidence: row.get(7)?,
        group_id: row.get(8)?,
    })
}

/// WHERE clause over the `m` (media) alias plus its bound values.
fn filter_clause(filter: &MediaFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(album_id) = filter.album_id {
        clauses.push("m.album_id = ?");
        values.push(Value::Integer(album_id));
    }
    if let Some(media_id) = filter.media_id {
        clauses.push("m.id = ?");
        values.push(Value::Integer(media_id));
    }
    if let Some(category) = filter.category {
        clauses.push("m.category = ?");
        values.push(Value::Text(category.as_str().to_string()));
    }
    if let Some(ref title) = filter.title {
        clauses.push("m.title = ?");
        values.push(Value::Text(title.clone()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

/// Delete the assets and faces of one media item, returning what was removed.
fn clear_derived(conn: &Connection, media_id: i64) -> rusqlite::Result<RemovedDerived> {
    let assets = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM media_assets a WHERE a.media_id = ? ORDER BY a.id"
        ))?;
        let assets = stmt
            .query_map([media_id], asset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        assets
    };

    let face_ids = {
        let mut stmt = conn.prepare("SELECT id FROM faces WHERE media_id = ? ORDER BY id")?;
        let ids = stmt
            .query_map([media_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        ids
    };

    conn.execute("DELETE FROM media_assets WHERE media_id = ?", [media_id])?;
    conn.execute("DELETE FROM faces WHERE media_id = ?", [media_id])?;

    Ok(RemovedDerived { assets, face_ids })
}

fn insert_face_row(conn: &Connection, media_id: i64, face: NewFace) -> rusqlite::Result<DetectedFace> {
    conn.execute(
        r#"
        INSERT INTO faces (media_id, bbox_x, bbox_y, bbox_w, bbox_h, embedding, embedding_dim, confidence)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            media_id,
            face.bbox.x,
            face.bbox.y,
            face.bbox.width,
            face.bbox.height,
            embedding_to_bytes(&face.embedding),
            face.embedding.len() as i64,
            face.confidence,
        ],
    )?;

    Ok(DetectedFace {
        id: conn.last_insert_rowid(),
        media_id,
        bbox: face.bbox,
        embedding: face.embedding,
        confidence: face.confidence,
        group_id: None,
    })
}

impl MediaStore for SqliteDb {
    fn find_or_create_album(&self, owner: &str, title: &str, path: &Path) -> StoreResult<Album> {
        let conn = self.conn()?;
        let path_str = path.to_string_lossy();

        let existing = conn
            .query_row(
                "SELECT id, title FROM albums WHERE owner = ? AND path = ?",
                params![owner, path_str],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (id, title) = match existing {
            Some(found) => found,
            None => {
                conn.execute(
                    "INSERT INTO albums (title, path, owner) VALUES (?, ?, ?)",
                    params![title, path_str, owner],
                )?;
                (conn.last_insert_rowid(), title.to_string())
            }
        };

        Ok(Album {
            id,
            title,
            path: path.to_path_buf(),
            owner: owner.to_string(),
        })
    }

    fn upsert_media(&self, album_id: i64, item: NewMediaItem) -> StoreResult<MediaUpsert> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let path_str = item.path.to_string_lossy();

        let existing = tx
            .query_row(
                "SELECT id, fingerprint FROM media WHERE album_id = ? AND relative_path = ?",
                params![album_id, item.relative_path],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (media_id, outcome, removed) = match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO media (album_id, title, relative_path, path, category, fingerprint)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        album_id,
                        item.title,
                        item.relative_path,
                        path_str,
                        item.category.as_str(),
                        item.fingerprint,
                    ],
                )?;
                (tx.last_insert_rowid(), UpsertOutcome::New, RemovedDerived::default())
            }
            Some((id, fingerprint)) if fingerprint == item.fingerprint => {
                tx.execute(
                    r#"
                    UPDATE media SET title = ?, path = ?, category = ?, scanned_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                    params![item.title, path_str, item.category.as_str(), id],
                )?;
                (id, UpsertOutcome::Unchanged, RemovedDerived::default())
            }
            Some((id, _)) => {
                let removed = clear_derived(&tx, id)?;
                tx.execute(
                    r#"
                    UPDATE media SET
                        title = ?, path = ?, category = ?, fingerprint = ?,
                        faces_scanned_at = NULL, scanned_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                    params![item.title, path_str, item.category.as_str(), item.fingerprint, id],
                )?;
                (id, UpsertOutcome::Changed, removed)
            }
        };

        let stored = tx.query_row(
            &format!("SELECT {MEDIA_COLUMNS} FROM media m WHERE m.id = ?"),
            [media_id],
            media_from_row,
        )?;
        tx.commit()?;

        Ok(MediaUpsert {
            item: stored,
            outcome,
            removed,
        })
    }

    fn remove_media(&self, media_id: i64) -> StoreResult<RemovedDerived> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = clear_derived(&tx, media_id)?;
        tx.execute("DELETE FROM media WHERE id = ?", [media_id])?;
        tx.commit()?;
        Ok(removed)
    }

    fn upsert_asset(
        &self,
        media_id: i64,
        asset: NewAsset,
    ) -> StoreResult<(DerivedAsset, Option<DerivedAsset>)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let select = format!(
            "SELECT {ASSET_COLUMNS} FROM media_assets a WHERE a.media_id = ? AND a.kind = ?"
        );

        let previous = tx
            .query_row(&select, params![media_id, asset.kind.as_str()], asset_from_row)
            .optional()?;

        tx.execute(
            r#"
            INSERT INTO media_assets (media_id, kind, name, path, width, height)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (media_id, kind) DO UPDATE SET
                name = excluded.name,
                path = excluded.path,
                width = excluded.width,
                height = excluded.height,
                created_at = CURRENT_TIMESTAMP
            "#,
            params![
                media_id,
                asset.kind.as_str(),
                asset.name,
                asset.path.to_string_lossy(),
                asset.width,
                asset.height,
            ],
        )?;

        let stored = tx.query_row(&select, params![media_id, asset.kind.as_str()], asset_from_row)?;
        tx.commit()?;

        Ok((stored, previous))
    }

    fn assets_for_media(&self, media_id: i64) -> StoreResult<Vec<DerivedAsset>> {
        self.list_assets(&MediaFilter::media(media_id))
    }

    fn insert_face(&self, media_id: i64, face: NewFace) -> StoreResult<DetectedFace> {
        let conn = self.conn()?;
        Ok(insert_face_row(&conn, media_id, face)?)
    }

    fn record_faces(&self, media_id: i64, faces: Vec<NewFace>) -> StoreResult<Vec<DetectedFace>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored = faces
            .into_iter()
            .map(|face| insert_face_row(&tx, media_id, face))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tx.execute(
            "UPDATE media SET faces_scanned_at = ? WHERE id = ?",
            params![now_timestamp(), media_id],
        )?;
        tx.commit()?;

        Ok(stored)
    }

    fn set_face_group(&self, face_id: i64, group_id: i64) -> StoreResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE faces SET group_id = ? WHERE id = ?",
            params![group_id, face_id],
        )?;
        if changed == 0 {
            return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        Ok(())
    }

    fn create_face_group(&self, label: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO face_groups (label) VALUES (?)", [label])?;
        Ok(conn.last_insert_rowid())
    }

    fn faces_for_media(&self, media_id: i64) -> StoreResult<Vec<DetectedFace>> {
        self.list_faces(&MediaFilter::media(media_id))
    }

    fn unassigned_faces(&self) -> StoreResult<Vec<DetectedFace>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces f WHERE f.group_id IS NULL ORDER BY f.id"
        ))?;
        let faces = stmt
            .query_map([], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn prune_empty_face_groups(&self) -> StoreResult<usize> {
        let removed = self.conn()?.execute(
            r#"
            DELETE FROM face_groups
            WHERE NOT EXISTS (SELECT 1 FROM faces f WHERE f.group_id = face_groups.id)
            "#,
            [],
        )?;
        Ok(removed)
    }

    fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<MediaItem>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media m {clause} ORDER BY m.id"
        ))?;
        let items = stmt
            .query_map(params_from_iter(values), media_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn list_assets(&self, filter: &MediaFilter) -> StoreResult<Vec<DerivedAsset>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM media_assets a JOIN media m ON m.id = a.media_id {clause} ORDER BY a.id"
        ))?;
        let assets = stmt
            .query_map(params_from_iter(values), asset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    fn list_faces(&self, filter: &MediaFilter) -> StoreResult<Vec<DetectedFace>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces f JOIN media m ON m.id = f.media_id {clause} ORDER BY f.id"
        ))?;
        let faces = stmt
            .query_map(params_from_iter(values), face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn list_face_groups(&self) -> StoreResult<Vec<FaceGroup>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT id, label FROM face_groups ORDER BY id")?;
        let mut groups = stmt
            .query_map([], |row| {
                Ok(FaceGroup {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    member_ids: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, group_id FROM faces WHERE group_id IS NOT NULL ORDER BY id",
        )?;
        let members = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (face_id, group_id) in members {
            if let Ok(idx) = groups.binary_search_by_key(&group_id, |g| g.id) {
                groups[idx].member_ids.push(face_id);
            }
        }

        Ok(groups)
    }
}
