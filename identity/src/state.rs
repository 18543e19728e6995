//! Authoritative in-memory state: the entity arena, cluster membership,
//! the orphan set, constraints and name bindings.
//!
//! Clusters hold entity IDs, never entity values. Every entity is either a
//! member of exactly one cluster or an orphan; [`EngineState::check`]
//! verifies this along with the other invariants.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::cluster::ClusterId;
use crate::constraints::ConstraintSet;
use crate::entity::{EntityId, EntityStore};

/// A group of entities believed to be the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: ClusterId,
    pub members: BTreeSet<EntityId>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Cluster membership plus the orphan set.
///
/// Clusters are kept in presentation order (descending size, stable for
/// ties).
#[derive(Debug, Clone, Default)]
pub struct Partition {
    clusters: Vec<Cluster>,
    membership: HashMap<EntityId, ClusterId>,
    orphans: BTreeSet<EntityId>,
}

impl Partition {
    /// Builds a partition from clusters and orphans. Empty clusters are
    /// dropped.
    pub fn from_parts(clusters: Vec<Cluster>, orphans: BTreeSet<EntityId>) -> Self {
        let clusters: Vec<Cluster> = clusters.into_iter().filter(|c| !c.is_empty()).collect();
        let mut membership = HashMap::new();
        for c in &clusters {
            for m in &c.members {
                membership.insert(m.clone(), c.id.clone());
            }
        }
        let mut p = Self {
            clusters,
            membership,
            orphans,
        };
        p.sort();
        p
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster(&self, id: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    /// Position of a cluster in presentation order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.clusters.iter().position(|c| c.id == id)
    }

    pub fn contains_cluster(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn cluster_of(&self, entity_id: &str) -> Option<&ClusterId> {
        self.membership.get(entity_id)
    }

    pub fn orphans(&self) -> &BTreeSet<EntityId> {
        &self.orphans
    }

    pub fn is_orphan(&self, entity_id: &str) -> bool {
        self.orphans.contains(entity_id)
    }

    /// Number of entities held by clusters.
    pub fn assigned(&self) -> usize {
        self.membership.len()
    }

    /// Removes an entity from whichever cluster or orphan set holds it.
    /// Returns the cluster it left, if any. Emptied clusters are kept;
    /// callers decide when to drop them.
    pub fn detach(&mut self, entity_id: &str) -> Option<ClusterId> {
        if let Some(cid) = self.membership.remove(entity_id) {
            if let Some(pos) = self.position(&cid) {
                self.clusters[pos].members.remove(entity_id);
            }
            return Some(cid);
        }
        self.orphans.remove(entity_id);
        None
    }

    /// Moves an entity into a cluster. Returns false (and changes nothing)
    /// if the cluster does not exist.
    pub fn assign(&mut self, entity_id: &str, cluster_id: &str) -> bool {
        let Some(pos) = self.position(cluster_id) else {
            return false;
        };
        self.detach(entity_id);
        self.clusters[pos].members.insert(entity_id.to_string());
        self.membership
            .insert(entity_id.to_string(), cluster_id.to_string());
        true
    }

    /// Moves an entity into the orphan set.
    pub fn orphan(&mut self, entity_id: &str) {
        self.detach(entity_id);
        self.orphans.insert(entity_id.to_string());
    }

    /// Removes a cluster. Its members are left unplaced; callers must
    /// re-place them.
    pub fn remove_cluster(&mut self, cluster_id: &str) -> Option<Cluster> {
        let pos = self.position(cluster_id)?;
        let cluster = self.clusters.remove(pos);
        for m in &cluster.members {
            self.membership.remove(m);
        }
        Some(cluster)
    }

    /// Drops every empty cluster and returns their IDs.
    pub fn drop_empty(&mut self) -> Vec<ClusterId> {
        let mut dropped = Vec::new();
        self.clusters.retain(|c| {
            if c.is_empty() {
                dropped.push(c.id.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Restores descending-size order. Stable for equal sizes.
    pub fn sort(&mut self) {
        self.clusters.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
        self.membership.clear();
        self.orphans.clear();
    }
}

/// Everything the engine owns, guarded as one unit.
#[derive(Default)]
pub struct EngineState {
    pub entities: EntityStore,
    pub partition: Partition,
    pub constraints: ConstraintSet,
    /// Custom display names by cluster ID.
    pub names: BTreeMap<ClusterId, String>,
    /// Sources already handed to the embedder.
    pub scanned: BTreeSet<String>,
}

impl EngineState {
    pub fn new(dim: usize) -> Self {
        Self {
            entities: EntityStore::new(dim),
            ..Default::default()
        }
    }

    /// Deletes a cluster together with its name binding. Members are left
    /// unplaced.
    pub fn delete_cluster(&mut self, cluster_id: &str) -> Option<Cluster> {
        self.names.remove(cluster_id);
        self.partition.remove_cluster(cluster_id)
    }

    /// Deletes `cluster_id` if it has no members left. Returns true if it
    /// was deleted.
    pub fn delete_if_empty(&mut self, cluster_id: &str) -> bool {
        let empty = self
            .partition
            .cluster(cluster_id)
            .is_some_and(Cluster::is_empty);
        if empty {
            self.delete_cluster(cluster_id);
        }
        empty
    }

    /// Drops name bindings whose cluster no longer exists.
    /// Returns true if any binding was removed.
    pub fn prune_names(&mut self) -> bool {
        let before = self.names.len();
        let partition = &self.partition;
        self.names.retain(|id, _| partition.contains_cluster(id));
        before != self.names.len()
    }

    pub fn unverified_count(&self, cluster: &Cluster) -> usize {
        cluster
            .members
            .iter()
            .filter(|m| !self.entities.is_verified(m))
            .count()
    }

    /// Checks the structural invariants:
    /// membership is exclusive, counts are conserved, no cluster is empty and
    /// no cluster holds an entity constrained against it.
    pub fn check(&self) -> Result<(), String> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut total = 0usize;
        for c in self.partition.clusters() {
            if c.is_empty() {
                return Err(format!("cluster {} is empty", c.id));
            }
            for m in &c.members {
                if !self.entities.contains(m) {
                    return Err(format!("cluster {} holds unknown entity {m}", c.id));
                }
                if !seen.insert(m.as_str()) {
                    return Err(format!("entity {m} is in more than one cluster"));
                }
                if self.partition.cluster_of(m) != Some(&c.id) {
                    return Err(format!("membership index disagrees for {m}"));
                }
                if self.partition.is_orphan(m) {
                    return Err(format!("entity {m} is both member and orphan"));
                }
                if self.constraints.forbids(m, &c.id) {
                    return Err(format!("entity {m} is constrained from {}", c.id));
                }
                total += 1;
            }
        }
        for o in self.partition.orphans() {
            if !self.entities.contains(o) {
                return Err(format!("unknown orphan {o}"));
            }
        }
        total += self.partition.orphans().len();
        if total != self.entities.len() {
            return Err(format!(
                "conservation broken: {} entities, {} placed",
                self.entities.len(),
                total
            ));
        }
        if self.partition.assigned() + self.partition.orphans().len() != total {
            return Err("membership index out of sync".to_string());
        }
        Ok(())
    }
}
