use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IdentityError, IdentityResult};
use crate::vector::normalized;

/// Identifier of an entity (a detected face, or a whole image).
pub type EntityId = String;

/// Pixel rectangle of a detection inside its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// A single embedded item.
///
/// Only `verified` (and cluster membership, which lives outside the record)
/// change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub verified: bool,
    /// Where the entity came from, usually an image path.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, source: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
            verified: false,
            source: source.into(),
            region: None,
            confidence: None,
            thumbnail: None,
            added_at: Utc::now(),
        }
    }
}

/// Derives a stable entity ID from its source and region.
///
/// Format: first 16 hex chars of SHA-256 over `"{source}_{x}_{y}_{w}_{h}"`,
/// or over `"{source}"` when there is no region.
pub fn entity_id(source: &str, region: Option<&Region>) -> EntityId {
    let key = match region {
        Some(r) => format!("{source}_{}_{}_{}_{}", r.x, r.y, r.w, r.h),
        None => source.to_string(),
    };
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

struct Slot {
    entity: Entity,
    unit: Vec<f32>,
}

/// Owned table of entities in insertion order.
///
/// Every entity also carries a unit-length copy of its embedding, computed
/// once on insert and used by every similarity computation.
pub struct EntityStore {
    configured_dim: usize,
    dim: usize,
    slots: Vec<Slot>,
    index: HashMap<EntityId, usize>,
}

impl EntityStore {
    /// Creates an empty store. `dim == 0` infers the dimension from the
    /// first inserted entity.
    pub fn new(dim: usize) -> Self {
        Self {
            configured_dim: dim,
            dim,
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Embedding dimension, or 0 if not known yet.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Checks that `embedding` could be inserted.
    pub fn check_dim(&self, embedding: &[f32]) -> IdentityResult<()> {
        if embedding.is_empty() {
            return Err(IdentityError::InvalidArgument("empty embedding".into()));
        }
        if self.dim != 0 && embedding.len() != self.dim {
            return Err(IdentityError::DimensionMismatch {
                expected: self.dim,
                got: embedding.len(),
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, entity: Entity) -> IdentityResult<()> {
        if self.index.contains_key(&entity.id) {
            return Err(IdentityError::InvalidArgument(format!(
                "duplicate entity id {}",
                entity.id
            )));
        }
        self.check_dim(&entity.embedding)?;
        if self.dim == 0 {
            self.dim = entity.embedding.len();
        }
        let unit = normalized(&entity.embedding);
        self.index.insert(entity.id.clone(), self.slots.len());
        self.slots.push(Slot { entity, unit });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|&i| &self.slots[i].entity)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Unit-length embedding of an entity.
    pub fn unit(&self, id: &str) -> Option<&[f32]> {
        self.index.get(id).map(|&i| self.slots[i].unit.as_slice())
    }

    /// Position of an entity in insertion order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Sets the verified flag. Returns false if the entity does not exist.
    pub fn set_verified(&mut self, id: &str, verified: bool) -> bool {
        match self.index.get(id) {
            Some(&i) => {
                self.slots[i].entity.verified = verified;
                true
            }
            None => false,
        }
    }

    pub fn is_verified(&self, id: &str) -> bool {
        self.get(id).is_some_and(|e| e.verified)
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let pos = self.index.remove(id)?;
        let slot = self.slots.remove(pos);
        for s in &self.slots[pos..] {
            if let Some(i) = self.index.get_mut(&s.entity.id) {
                *i -= 1;
            }
        }
        Some(slot.entity)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.slots.iter().map(|s| &s.entity)
    }

    /// Iterates `(entity, unit embedding)` pairs in insertion order.
    pub fn units(&self) -> impl Iterator<Item = (&Entity, &[f32])> {
        self.slots.iter().map(|s| (&s.entity, s.unit.as_slice()))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.dim = self.configured_dim;
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        EntityStore::new(0)
    }
}
