use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterId;
use crate::entity::EntityId;

/// Hard exclusions: an entity must never be placed in any of its listed
/// clusters again.
///
/// Append-only; the only way to drop entries is [`ConstraintSet::clear`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet {
    inner: BTreeMap<EntityId, BTreeSet<ClusterId>>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `entity_id` must never join `cluster_id`.
    /// Returns false if the constraint already existed.
    pub fn add(&mut self, entity_id: &str, cluster_id: &str) -> bool {
        self.inner
            .entry(entity_id.to_string())
            .or_default()
            .insert(cluster_id.to_string())
    }

    /// Clusters `entity_id` is excluded from. Empty if none were recorded.
    pub fn get(&self, entity_id: &str) -> BTreeSet<ClusterId> {
        self.inner.get(entity_id).cloned().unwrap_or_default()
    }

    pub fn forbids(&self, entity_id: &str, cluster_id: &str) -> bool {
        self.inner
            .get(entity_id)
            .is_some_and(|set| set.contains(cluster_id))
    }

    /// Number of entities with at least one constraint.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Total number of (entity, cluster) pairs.
    pub fn pair_count(&self) -> usize {
        self.inner.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &BTreeSet<ClusterId>)> {
        self.inner.iter()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
