pub const SCHEMA: &str = r#"
-- Albums: directory-backed collections, created by the caller
CREATE TABLE IF NOT EXISTS albums (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    path TEXT NOT NULL,
    owner TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (owner, path)
);

-- Media: one row per registered file, keyed by album + relative path
CREATE TABLE IF NOT EXISTS media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    album_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    path TEXT NOT NULL,
    category TEXT NOT NULL,       -- 'standard_image', 'highres_image', 'unsupported_video'
    fingerprint TEXT NOT NULL,    -- '<size>:<mtime>' of the source file
    scanned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (album_id, relative_path),
    FOREIGN KEY (album_id) REFERENCES albums(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_media_album ON media(album_id);
CREATE INDEX IF NOT EXISTS idx_media_category ON media(category);

-- Derived assets: at most one per media item and kind
CREATE TABLE IF NOT EXISTS media_assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER NOT NULL,
    kind TEXT NOT NULL,           -- 'thumbnail' or 'highres'
    name TEXT NOT NULL,           -- e.g. 'thumbnail_boy1.jpg'
    path TEXT NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (media_id, kind),
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_media_assets_name ON media_assets(name);

-- Face groups: clusters of faces believed to be the same person
CREATE TABLE IF NOT EXISTS face_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,          -- Auto-generated name like "Person 1"
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Faces: detected in thumbnails, with embeddings
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    embedding BLOB NOT NULL,      -- f32 little-endian
    embedding_dim INTEGER NOT NULL,
    confidence REAL NOT NULL,
    group_id INTEGER,             -- NULL until clustered
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE,
    FOREIGN KEY (group_id) REFERENCES face_groups(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_media ON faces(media_id);
CREATE INDEX IF NOT EXISTS idx_faces_group ON faces(group_id);
"#;

/// Idempotent schema upgrades; failures (column already present) are ignored.
pub const MIGRATIONS: &[&str] = &[
    // Track face detection per media item so failed detections are retried
    "ALTER TABLE media ADD COLUMN faces_scanned_at TEXT",
];
