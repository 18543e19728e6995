#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use lumen_identity::{Config, Engine, Entity};

/// Unit vector in the plane at `deg` degrees.
pub fn at(deg: f32) -> Vec<f32> {
    let r = deg.to_radians();
    vec![r.cos(), r.sin()]
}

/// Deterministic pseudo-random unit vector. Components are centered on
/// zero before normalizing.
pub fn random_unit_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    let mut state = seed;
    for _ in 0..dim {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        v.push((state >> 40) as f32 / (1u64 << 24) as f32 - 0.5);
    }
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    let s = (1.0 / norm) as f32;
    v.iter().map(|x| x * s).collect()
}

/// `groups` loose identities with `per_group` noisy members each, in `dim`
/// dimensions. IDs are `g{group}_{i}`.
pub fn noisy_groups(dim: usize, groups: usize, per_group: usize, noise: f32) -> Vec<Entity> {
    let mut out = Vec::new();
    for g in 0..groups {
        let center = random_unit_vec(dim, 1000 + g as u64);
        for i in 0..per_group {
            let r = random_unit_vec(dim, 7 * (g * per_group + i) as u64 + 3);
            let emb: Vec<f32> = center.iter().zip(&r).map(|(c, r)| c + r * noise).collect();
            let id = format!("g{g}_{i}");
            out.push(Entity::new(id.clone(), format!("{id}.jpg"), emb));
        }
    }
    out
}

/// Planar entities, one per `(id, degrees)` pair.
pub fn planar(points: &[(&str, f32)]) -> Vec<Entity> {
    points
        .iter()
        .map(|(id, deg)| Entity::new(*id, format!("{id}.jpg"), at(*deg)))
        .collect()
}

pub fn engine_with(entities: Vec<Entity>) -> Engine {
    let engine = Engine::in_memory(Config::default()).unwrap();
    engine.add_entities(entities).unwrap();
    engine
}

/// Cluster ID to member set.
pub fn partition(engine: &Engine) -> BTreeMap<String, BTreeSet<String>> {
    engine
        .get_clusters()
        .into_iter()
        .map(|c| (c.id, c.members.into_iter().map(|m| m.id).collect()))
        .collect()
}

pub fn orphans(engine: &Engine) -> BTreeSet<String> {
    engine.get_orphans().into_iter().map(|e| e.id).collect()
}

pub fn cluster_of(engine: &Engine, entity_id: &str) -> Option<String> {
    engine.get_entity(entity_id).unwrap().cluster_id
}
