//! One-shot equivalence-class clustering over unit embeddings.
//!
//! Every pair of entities is compared exactly once. Pairs at or above the
//! threshold are unioned, so classes are the transitive closure of the
//! "similar enough" relation: if A~B and B~C clear the threshold, A, B and C
//! end up together even when A~C does not. This is how chains of the same
//! face under varying light and pose get grouped.
//!
//! Rows are processed in blocks of `block_size`. Progress is reported and
//! cancellation is observed once per block.

use std::collections::HashMap;
use std::ops::ControlFlow;

use crate::entity::{EntityId, EntityStore};
use crate::error::{IdentityError, IdentityResult};
use crate::unionfind::DisjointSet;
use crate::vector::dot;

/// Identifier of a cluster.
pub type ClusterId = String;

/// Builds the cluster ID for a class whose canonical member is `entity_id`.
pub fn cluster_id(prefix: &str, entity_id: &str) -> ClusterId {
    if prefix.is_empty() {
        entity_id.to_string()
    } else {
        format!("{prefix}_{entity_id}")
    }
}

/// How far a clustering pass has come, reported after each row block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockProgress {
    pub rows_done: usize,
    pub rows_total: usize,
}

impl BlockProgress {
    /// Fraction of pairwise comparisons done. Row `i` compares against the
    /// `n - 1 - i` rows after it, so early blocks weigh more than late ones.
    pub fn fraction(&self) -> f32 {
        let n = self.rows_total as f64;
        let r = self.rows_done as f64;
        let total = n * (n - 1.0) / 2.0;
        if total <= 0.0 {
            return 1.0;
        }
        let done = r * (n - 1.0) - r * (r - 1.0) / 2.0;
        (done / total).clamp(0.0, 1.0) as f32
    }
}

/// One equivalence class produced by a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Class {
    pub id: ClusterId,
    /// Members in entity order; the first one is canonical.
    pub members: Vec<EntityId>,
}

/// Groups index positions of `units` into classes.
///
/// Classes are returned in order of their first member; members are in
/// ascending index order. `on_block` returning `Break` cancels the pass.
pub fn union_classes(
    units: &[&[f32]],
    threshold: f32,
    block_size: usize,
    on_block: &mut dyn FnMut(BlockProgress) -> ControlFlow<()>,
) -> IdentityResult<Vec<Vec<usize>>> {
    let n = units.len();
    let block_size = block_size.max(1);
    let mut set = DisjointSet::new(n);

    let mut start = 0;
    while start < n {
        let end = (start + block_size).min(n);
        for i in start..end {
            let a = units[i];
            for (j, b) in units.iter().enumerate().skip(i + 1) {
                if dot(a, b) >= threshold {
                    set.union(i, j);
                }
            }
        }
        start = end;
        let progress = BlockProgress {
            rows_done: end,
            rows_total: n,
        };
        if on_block(progress).is_break() && end < n {
            return Err(IdentityError::Cancelled);
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    for i in 0..n {
        let root = set.find(i);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(i);
    }
    Ok(groups)
}

/// Clusters every entity of a store.
pub struct ClusterEngine {
    pub block_size: usize,
    pub id_prefix: String,
}

impl ClusterEngine {
    pub fn new(block_size: usize, id_prefix: impl Into<String>) -> Self {
        Self {
            block_size,
            id_prefix: id_prefix.into(),
        }
    }

    /// Runs one pass over `entities`.
    ///
    /// Output is sorted by descending size; equal sizes keep the order of
    /// their canonical members.
    pub fn cluster(
        &self,
        entities: &EntityStore,
        threshold: f32,
        on_block: &mut dyn FnMut(BlockProgress) -> ControlFlow<()>,
    ) -> IdentityResult<Vec<Class>> {
        let (ids, units): (Vec<&str>, Vec<&[f32]>) =
            entities.units().map(|(e, u)| (e.id.as_str(), u)).unzip();

        let groups = union_classes(&units, threshold, self.block_size, on_block)?;

        let mut classes: Vec<Class> = groups
            .into_iter()
            .map(|group| {
                let members: Vec<EntityId> = group.iter().map(|&i| ids[i].to_string()).collect();
                Class {
                    id: cluster_id(&self.id_prefix, &members[0]),
                    members,
                }
            })
            .collect();
        classes.sort_by(|a, b| b.members.len().cmp(&a.members.len()));
        Ok(classes)
    }
}
