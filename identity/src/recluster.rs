//! Constrained re-clustering around verified anchors.
//!
//! A single bounded pass, not iterated to a fixpoint:
//!
//! 1. Every cluster with verified members yields an anchor centroid computed
//!    from those members only.
//! 2. New clusters start with just their verified members. Verified entities
//!    are pinned and never move in this pass.
//! 3. Every unverified member of every cluster goes to its best anchor that
//!    clears the threshold and is not forbidden by its constraints, or
//!    becomes an orphan.
//! 4. Existing orphans get one more try against the same anchors.
//! 5. Clusters without an anchor disappear.
//!
//! The pass is computed from a read-only view of the state and produces a
//! [`ReclusterPlan`]; nothing changes until the plan is applied.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use serde::Serialize;

use crate::cluster::ClusterId;
use crate::entity::EntityId;
use crate::error::{IdentityError, IdentityResult};
use crate::resolver::{CentroidPolicy, candidates, find_best_cluster};
use crate::state::{Cluster, EngineState, Partition};

/// Entities processed between progress reports and cancellation checks.
const PROGRESS_BATCH: usize = 1024;

/// What a re-cluster pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclusterStats {
    /// Unverified entities placed in a different cluster than they started in.
    pub moved: usize,
    /// Unverified members that found no anchor and became orphans.
    pub newly_orphaned: usize,
    /// Orphans from before the pass that found a home.
    pub orphans_placed: usize,
    pub orphans_remaining: usize,
    pub clusters_before: usize,
    pub clusters_after: usize,
}

/// Result of a re-cluster pass, ready to be applied.
#[derive(Debug, Clone)]
pub struct ReclusterPlan {
    pub partition: Partition,
    /// Clusters that existed before the pass and do not exist after it.
    pub dropped: Vec<ClusterId>,
    pub stats: ReclusterStats,
    /// Unverified members and orphans the pass visited.
    pub processed: usize,
}

/// Computes a re-cluster pass over `state`.
///
/// Fails with `InvalidState` when no entity anywhere is verified.
/// `on_batch(done, total)` is called every [`PROGRESS_BATCH`] entities
/// while work remains; returning `Break` cancels the pass.
pub fn plan(
    state: &EngineState,
    threshold: f32,
    on_batch: &mut dyn FnMut(usize, usize) -> ControlFlow<()>,
) -> IdentityResult<ReclusterPlan> {
    let partition = &state.partition;
    let entities = &state.entities;

    let anchors = candidates(partition, entities, CentroidPolicy::VerifiedOnly);
    if anchors.is_empty() {
        return Err(IdentityError::InvalidState(
            "no verified anchors; verify some entities first".into(),
        ));
    }

    let mut clusters: BTreeMap<ClusterId, BTreeSet<EntityId>> = BTreeMap::new();
    let mut unverified: Vec<(&EntityId, &ClusterId)> = Vec::new();
    for c in partition.clusters() {
        let pinned: BTreeSet<EntityId> = c
            .members
            .iter()
            .filter(|m| entities.is_verified(m))
            .cloned()
            .collect();
        if !pinned.is_empty() {
            clusters.insert(c.id.clone(), pinned);
        }
        for m in &c.members {
            if !entities.is_verified(m) {
                unverified.push((m, &c.id));
            }
        }
    }

    let orphans_before = partition.orphans();
    let total = unverified.len() + orphans_before.len();
    let mut done = 0usize;
    let mut tick = |done: usize| -> IdentityResult<()> {
        if done % PROGRESS_BATCH == 0 && done < total && on_batch(done, total).is_break() {
            return Err(IdentityError::Cancelled);
        }
        Ok(())
    };

    let mut stats = ReclusterStats {
        clusters_before: partition.clusters().len(),
        ..Default::default()
    };
    let mut orphans: BTreeSet<EntityId> = BTreeSet::new();

    for (entity_id, origin) in unverified {
        tick(done)?;
        done += 1;
        let Some(unit) = entities.unit(entity_id) else {
            continue;
        };
        match find_best_cluster(entity_id, unit, &anchors, &[], &state.constraints, threshold) {
            Some(p) => {
                if &p.cluster_id != origin {
                    stats.moved += 1;
                }
                clusters.entry(p.cluster_id).or_default().insert(entity_id.clone());
            }
            None => {
                stats.newly_orphaned += 1;
                orphans.insert(entity_id.clone());
            }
        }
    }

    for entity_id in orphans_before {
        tick(done)?;
        done += 1;
        let Some(unit) = entities.unit(entity_id) else {
            continue;
        };
        match find_best_cluster(entity_id, unit, &anchors, &[], &state.constraints, threshold) {
            Some(p) => {
                stats.orphans_placed += 1;
                clusters.entry(p.cluster_id).or_default().insert(entity_id.clone());
            }
            None => {
                orphans.insert(entity_id.clone());
            }
        }
    }

    // Keep the previous presentation order as the tie-break for equal sizes.
    let mut ordered: Vec<Cluster> = Vec::with_capacity(clusters.len());
    let mut dropped = Vec::new();
    for c in partition.clusters() {
        match clusters.remove(&c.id) {
            Some(members) if !members.is_empty() => ordered.push(Cluster {
                id: c.id.clone(),
                members,
            }),
            _ => dropped.push(c.id.clone()),
        }
    }

    stats.orphans_remaining = orphans.len();
    stats.clusters_after = ordered.len();

    Ok(ReclusterPlan {
        partition: Partition::from_parts(ordered, orphans),
        dropped,
        stats,
        processed: done,
    })
}
