//! Human corrections: verify, reject, merge, rename.
//!
//! Each function mutates [`EngineState`] in place and returns the sections it
//! touched so the caller can persist them. Validation happens before the
//! first mutation, so a failed call leaves the state unchanged.

use serde::Serialize;

use crate::cluster::ClusterId;
use crate::entity::EntityId;
use crate::error::{IdentityError, IdentityResult};
use crate::resolver::{CentroidPolicy, Placement, candidates, find_best_cluster};
use crate::state::EngineState;
use crate::store::Section;

/// Result of [`verify`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// The entity is now pinned to its cluster.
    Verified,
    /// The entity was rejected and moved to another cluster, unverified.
    Rehomed {
        cluster_id: ClusterId,
        similarity: f32,
        /// The cluster it was rejected from became empty and was deleted.
        origin_deleted: bool,
    },
    /// The entity was rejected and no cluster accepted it.
    Orphaned { origin_deleted: bool },
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub cluster_id: ClusterId,
    /// Source members now in the target.
    pub moved: usize,
    /// Source members constrained against the target that found another home.
    pub rehomed: Vec<EntityId>,
    /// Source members constrained against the target that became orphans.
    pub orphaned: Vec<EntityId>,
}

/// Where [`place_all`] put each entity.
#[derive(Debug, Default)]
pub(crate) struct Placed {
    pub rehomed: Vec<(EntityId, Placement)>,
    pub orphaned: Vec<EntityId>,
}

/// Places entities that currently belong nowhere: into the best cluster that
/// clears `threshold`, or into the orphan set.
///
/// Candidate centroids are computed once, before anything moves. Every
/// placed entity loses its verified flag.
pub(crate) fn place_all(
    state: &mut EngineState,
    ids: &[EntityId],
    exclude: &[&str],
    threshold: f32,
) -> Placed {
    let cands = candidates(
        &state.partition,
        &state.entities,
        CentroidPolicy::PreferVerified,
    );
    let mut placed = Placed::default();
    for id in ids {
        let best = state.entities.unit(id).and_then(|unit| {
            find_best_cluster(id, unit, &cands, exclude, &state.constraints, threshold)
        });
        state.entities.set_verified(id, false);
        match best {
            Some(p) if state.partition.assign(id, &p.cluster_id) => {
                placed.rehomed.push((id.clone(), p));
            }
            _ => {
                state.partition.orphan(id);
                placed.orphaned.push(id.clone());
            }
        }
    }
    placed
}

/// Accepts or rejects `entity_id`'s membership in `cluster_id`.
///
/// Accepting pins the entity. Rejecting records a constraint, re-homes the
/// entity to the best other cluster at `threshold` (or orphans it) and
/// deletes the origin cluster if it became empty.
pub fn verify(
    state: &mut EngineState,
    entity_id: &str,
    cluster_id: &str,
    accept: bool,
    threshold: f32,
) -> IdentityResult<(VerifyOutcome, Vec<Section>)> {
    if !state.entities.contains(entity_id) {
        return Err(IdentityError::entity(entity_id));
    }
    if !state.partition.contains_cluster(cluster_id) {
        return Err(IdentityError::cluster(cluster_id));
    }
    if state.partition.cluster_of(entity_id).map(String::as_str) != Some(cluster_id) {
        return Err(IdentityError::membership(entity_id, cluster_id));
    }

    if accept {
        state.entities.set_verified(entity_id, true);
        return Ok((VerifyOutcome::Verified, vec![Section::Entities]));
    }

    state.constraints.add(entity_id, cluster_id);
    state.partition.detach(entity_id);
    let placed = place_all(state, &[entity_id.to_string()], &[cluster_id], threshold);
    let origin_deleted = state.delete_if_empty(cluster_id);

    let mut touched = vec![Section::Entities, Section::Constraints, Section::Orphans];
    if origin_deleted {
        touched.push(Section::Names);
    }
    let outcome = match placed.rehomed.into_iter().next() {
        Some((_, p)) => VerifyOutcome::Rehomed {
            cluster_id: p.cluster_id,
            similarity: p.similarity,
            origin_deleted,
        },
        None => VerifyOutcome::Orphaned { origin_deleted },
    };
    Ok((outcome, touched))
}

/// Moves every member of `source_id` into `target_id` and deletes the
/// source with its name binding. The target keeps its name.
///
/// Members constrained against the target are re-homed elsewhere at
/// `threshold`, or orphaned.
pub fn merge(
    state: &mut EngineState,
    source_id: &str,
    target_id: &str,
    threshold: f32,
) -> IdentityResult<(MergeOutcome, Vec<Section>)> {
    if source_id == target_id {
        return Err(IdentityError::InvalidArgument(format!(
            "cannot merge cluster {source_id} into itself"
        )));
    }
    if !state.partition.contains_cluster(source_id) {
        return Err(IdentityError::cluster(source_id));
    }
    if !state.partition.contains_cluster(target_id) {
        return Err(IdentityError::cluster(target_id));
    }

    let Some(source) = state.delete_cluster(source_id) else {
        return Err(IdentityError::cluster(source_id));
    };

    let mut moved = 0;
    let mut blocked = Vec::new();
    for m in source.members {
        if state.constraints.forbids(&m, target_id) {
            blocked.push(m);
        } else {
            state.partition.assign(&m, target_id);
            moved += 1;
        }
    }

    let placed = place_all(state, &blocked, &[target_id], threshold);
    let mut touched = vec![Section::Entities, Section::Names];
    if !placed.orphaned.is_empty() {
        touched.push(Section::Orphans);
    }
    Ok((
        MergeOutcome {
            cluster_id: target_id.to_string(),
            moved,
            rehomed: placed.rehomed.into_iter().map(|(id, _)| id).collect(),
            orphaned: placed.orphaned,
        },
        touched,
    ))
}

/// Binds a display name to a cluster. Returns the stored (trimmed) name.
pub fn rename(state: &mut EngineState, cluster_id: &str, name: &str) -> IdentityResult<String> {
    if !state.partition.contains_cluster(cluster_id) {
        return Err(IdentityError::cluster(cluster_id));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(IdentityError::InvalidArgument("empty cluster name".into()));
    }
    state.names.insert(cluster_id.to_string(), name.to_string());
    Ok(name.to_string())
}
