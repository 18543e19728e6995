//! Best-cluster search for a single entity.
//!
//! Rejection, merge eviction, online placement of new entities and the
//! re-cluster pass all go through [`find_best_cluster`]. They differ only in
//! which candidates they build: rejection and placement use
//! [`CentroidPolicy::PreferVerified`] over every live cluster, re-clustering
//! uses [`CentroidPolicy::VerifiedOnly`] so only anchored clusters compete.

use crate::cluster::ClusterId;
use crate::constraints::ConstraintSet;
use crate::entity::EntityStore;
use crate::state::{Cluster, Partition};
use crate::vector::{centroid, dot};

/// Which members feed a cluster's representative centroid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentroidPolicy {
    /// Verified members if there are any, otherwise all members.
    PreferVerified,
    /// Verified members only; clusters without any are skipped.
    VerifiedOnly,
}

/// A cluster competing for an entity.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub cluster_id: ClusterId,
    /// Unit-length representative centroid.
    pub centroid: Vec<f32>,
}

/// Where an entity should go, and how well it fits there.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub cluster_id: ClusterId,
    pub similarity: f32,
}

/// Representative centroid of a cluster under `policy`.
pub fn representative_centroid(
    cluster: &Cluster,
    entities: &EntityStore,
    policy: CentroidPolicy,
) -> Option<Vec<f32>> {
    let verified: Vec<&[f32]> = cluster
        .members
        .iter()
        .filter(|m| entities.is_verified(m))
        .filter_map(|m| entities.unit(m))
        .collect();
    if !verified.is_empty() {
        return centroid(verified, entities.dim());
    }
    match policy {
        CentroidPolicy::VerifiedOnly => None,
        CentroidPolicy::PreferVerified => centroid(
            cluster.members.iter().filter_map(|m| entities.unit(m)),
            entities.dim(),
        ),
    }
}

/// Candidates for every cluster of `partition`, in presentation order.
pub fn candidates(
    partition: &Partition,
    entities: &EntityStore,
    policy: CentroidPolicy,
) -> Vec<Candidate> {
    partition
        .clusters()
        .iter()
        .filter_map(|c| {
            representative_centroid(c, entities, policy).map(|centroid| Candidate {
                cluster_id: c.id.clone(),
                centroid,
            })
        })
        .collect()
}

/// Finds the candidate whose centroid is most similar to `unit`.
///
/// Candidates listed in `exclude` or forbidden for `entity_id` by
/// `constraints` are skipped. Returns `None` unless the best similarity is
/// at least `threshold`. Exact ties keep the earlier candidate.
pub fn find_best_cluster(
    entity_id: &str,
    unit: &[f32],
    candidates: &[Candidate],
    exclude: &[&str],
    constraints: &ConstraintSet,
    threshold: f32,
) -> Option<Placement> {
    let mut best: Option<Placement> = None;
    for c in candidates {
        if exclude.contains(&c.cluster_id.as_str()) {
            continue;
        }
        if constraints.forbids(entity_id, &c.cluster_id) {
            continue;
        }
        let sim = dot(unit, &c.centroid);
        if best.as_ref().is_none_or(|b| sim > b.similarity) {
            best = Some(Placement {
                cluster_id: c.cluster_id.clone(),
                similarity: sim,
            });
        }
    }
    best.filter(|b| b.similarity >= threshold)
}
