//! Online grouping of detected faces into identities.
//!
//! Each face joins the group whose centroid is nearest by cosine distance,
//! if that distance is below the match threshold; otherwise it starts a new
//! group. Groups are never merged or split afterwards.

use std::collections::HashMap;
use std::sync::Mutex;

use super::detector::l2_normalize;
use crate::db::{DetectedFace, MediaFilter, MediaStore};
use crate::error::StoreError;

/// Cosine distance below which a face joins an existing group.
pub const DEFAULT_MATCH_DISTANCE: f32 = 0.5;

const LABEL_PREFIX: &str = "Person ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Joined { group_id: i64 },
    Created { group_id: i64 },
}

impl Assignment {
    pub fn group_id(&self) -> i64 {
        match *self {
            Assignment::Joined { group_id } | Assignment::Created { group_id } => group_id,
        }
    }
}

struct GroupRecord {
    id: i64,
    /// Member face ids with their normalised embeddings.
    members: Vec<(i64, Vec<f32>)>,
    /// Sum of the member embeddings. Same direction as the centroid.
    sum: Vec<f32>,
}

impl GroupRecord {
    fn new(id: i64) -> Self {
        Self {
            id,
            members: Vec::new(),
            sum: Vec::new(),
        }
    }

    fn add(&mut self, face_id: i64, embedding: Vec<f32>) {
        if self.sum.is_empty() {
            self.sum = vec![0.0; embedding.len()];
        }
        for (s, v) in self.sum.iter_mut().zip(&embedding) {
            *s += v;
        }
        self.members.push((face_id, embedding));
    }

    fn remove(&mut self, face_id: i64) {
        if let Some(pos) = self.members.iter().position(|(id, _)| *id == face_id) {
            let (_, embedding) = self.members.remove(pos);
            for (s, v) in self.sum.iter_mut().zip(&embedding) {
                *s -= v;
            }
        }
    }

    #[cfg(test)]
    fn centroid(&self) -> Vec<f32> {
        let n = self.members.len().max(1) as f32;
        self.sum.iter().map(|s| s / n).collect()
    }
}

/// Arena of groups plus an index from group id to arena slot.
#[derive(Default)]
struct GroupTable {
    groups: Vec<GroupRecord>,
    index: HashMap<i64, usize>,
    face_groups: HashMap<i64, i64>,
    last_label: u64,
}

impl GroupTable {
    fn insert(&mut self, record: GroupRecord) -> usize {
        let slot = self.groups.len();
        self.index.insert(record.id, slot);
        self.groups.push(record);
        slot
    }

    fn add_member(&mut self, slot: usize, face_id: i64, embedding: Vec<f32>) {
        let group = &mut self.groups[slot];
        group.add(face_id, embedding);
        self.face_groups.insert(face_id, group.id);
    }

    /// Nearest non-empty group: smallest distance, then lowest id.
    fn nearest(&self, embedding: &[f32]) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;

        for (slot, group) in self.groups.iter().enumerate() {
            if group.members.is_empty() {
                continue;
            }
            let Some(distance) = cosine_distance(&group.sum, embedding) else {
                continue;
            };

            let better = match best {
                None => true,
                Some((best_slot, best_distance)) => {
                    distance < best_distance
                        || (distance == best_distance && group.id < self.groups[best_slot].id)
                }
            };
            if better {
                best = Some((slot, distance));
            }
        }

        best
    }

    /// Label for the next group. Only taken once the group row exists.
    fn next_label(&self) -> String {
        format!("{LABEL_PREFIX}{}", self.last_label + 1)
    }

    fn remove_empty(&mut self) {
        self.groups.retain(|g| !g.members.is_empty());
        self.index = self
            .groups
            .iter()
            .enumerate()
            .map(|(slot, g)| (g.id, slot))
            .collect();
    }
}

/// `1 - cos(a, b)`, or None when the vectors cannot be compared.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        Some(1.0 - dot / (norm_a * norm_b))
    } else {
        None
    }
}

/// Shared face group table used by all scan workers.
///
/// Finding the nearest group and joining or creating it, store writes
/// included, happens under one lock, so two faces of the same new person
/// processed concurrently end up in the same group.
pub struct FaceClusters {
    match_distance: f32,
    table: Mutex<GroupTable>,
}

impl FaceClusters {
    pub fn new(match_distance: f32) -> Self {
        Self {
            match_distance,
            table: Mutex::new(GroupTable::default()),
        }
    }

    /// Seed the table from the groups and assigned faces already stored.
    pub fn load(store: &dyn MediaStore, match_distance: f32) -> Result<Self, StoreError> {
        let mut table = GroupTable::default();

        for group in store.list_face_groups()? {
            if let Some(n) = group
                .label
                .strip_prefix(LABEL_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
            {
                table.last_label = table.last_label.max(n);
            }
            table.insert(GroupRecord::new(group.id));
        }

        for face in store.list_faces(&MediaFilter::default())? {
            let Some(group_id) = face.group_id else {
                continue;
            };
            if let Some(&slot) = table.index.get(&group_id) {
                table.add_member(slot, face.id, l2_normalize(&face.embedding));
            }
        }

        tracing::debug!(groups = table.groups.len(), "Loaded face groups");
        Ok(Self {
            match_distance,
            table: Mutex::new(table),
        })
    }

    /// Put `face` into a group, persisting the membership.
    ///
    /// A face that already belongs to a group keeps it.
    pub fn assign(&self, store: &dyn MediaStore, face: &DetectedFace) -> Result<Assignment, StoreError> {
        let embedding = l2_normalize(&face.embedding);
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;

        if let Some(&group_id) = table.face_groups.get(&face.id) {
            return Ok(Assignment::Joined { group_id });
        }

        match table.nearest(&embedding) {
            Some((slot, distance)) if distance < self.match_distance => {
                let group_id = table.groups[slot].id;
                store.set_face_group(face.id, group_id)?;
                table.add_member(slot, face.id, embedding);
                tracing::trace!(face_id = face.id, group_id, distance, "Face joined group");
                Ok(Assignment::Joined { group_id })
            }
            _ => {
                let label = table.next_label();
                let group_id = store.create_face_group(&label)?;
                table.last_label += 1;
                store.set_face_group(face.id, group_id)?;
                let slot = table.insert(GroupRecord::new(group_id));
                table.add_member(slot, face.id, embedding);
                tracing::debug!(face_id = face.id, group_id, %label, "Created face group");
                Ok(Assignment::Created { group_id })
            }
        }
    }

    /// Group every stored face that has none yet. Returns the groups created.
    pub fn assign_unassigned(&self, store: &dyn MediaStore) -> Result<usize, StoreError> {
        let mut created = 0;
        for face in store.unassigned_faces()? {
            if matches!(self.assign(store, &face)?, Assignment::Created { .. }) {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Drop faces that no longer exist in the store. Groups left empty are
    /// removed from the table.
    pub fn forget(&self, face_ids: &[i64]) -> Result<(), StoreError> {
        if face_ids.is_empty() {
            return Ok(());
        }

        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let mut emptied = false;
        for face_id in face_ids {
            let Some(group_id) = table.face_groups.remove(face_id) else {
                continue;
            };
            if let Some(&slot) = table.index.get(&group_id) {
                let group = &mut table.groups[slot];
                group.remove(*face_id);
                emptied |= group.members.is_empty();
            }
        }
        if emptied {
            table.remove_empty();
        }
        Ok(())
    }

    #[cfg(test)]
    fn group_of(&self, face_id: i64) -> Option<i64> {
        let table = self.table.lock().ok()?;
        table.face_groups.get(&face_id).copied()
    }

    /// Number of non-empty groups.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .map(|t| t.groups.iter().filter(|g| !g.members.is_empty()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Centroid of a group, if it exists and has members.
    #[cfg(test)]
    fn centroid(&self, group_id: i64) -> Option<Vec<f32>> {
        let table = self.table.lock().ok()?;
        let group = &table.groups[*table.index.get(&group_id)?];
        (!group.members.is_empty()).then(|| group.centroid())
    }
}
