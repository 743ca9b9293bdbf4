//! Face and face group records.

/// Bounding box for a detected face, in thumbnail pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A detected face in a media item's thumbnail.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub id: i64,
    pub media_id: i64,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
    /// None only between detection and clustering.
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// A cluster of faces believed to show the same person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceGroup {
    pub id: i64,
    pub label: String,
    /// Member face ids, ascending.
    pub member_ids: Vec<i64>,
}

/// Convert f32 embedding to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
