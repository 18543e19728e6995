mod common;

use std::collections::{BTreeMap, BTreeSet};

use common::{engine_with, noisy_groups, orphans, partition};
use lumen_identity::{ClusterEngine, EntityStore, VerifyOutcome};

/// Maps every entity to the index of its class.
fn labels(classes: &[lumen_identity::Class]) -> BTreeMap<String, usize> {
    classes
        .iter()
        .enumerate()
        .flat_map(|(i, c)| c.members.iter().map(move |m| (m.clone(), i)))
        .collect()
}

fn store_of(entities: Vec<lumen_identity::Entity>) -> EntityStore {
    let mut store = EntityStore::new(0);
    for e in entities {
        store.insert(e).unwrap();
    }
    store
}

#[test]
fn clustering_is_idempotent() {
    let engine = engine_with(noisy_groups(16, 5, 12, 0.35));
    engine.cluster(0.65).unwrap();
    let first = partition(&engine);
    engine.cluster(0.65).unwrap();
    let second = partition(&engine);
    assert_eq!(first, second);
    assert_eq!(first.len(), 5);
}

#[test]
fn noisy_groups_come_back_apart() {
    let store = store_of(noisy_groups(16, 5, 12, 0.35));
    let mut go = |_: lumen_identity::BlockProgress| std::ops::ControlFlow::Continue(());
    let classes = ClusterEngine::new(500, "cluster")
        .cluster(&store, 0.65, &mut go)
        .unwrap();
    assert_eq!(classes.len(), 5);
    for class in &classes {
        assert_eq!(class.members.len(), 12);
        let group = class.members[0].split('_').next().unwrap();
        assert!(class.members.iter().all(|m| m.starts_with(&format!("{group}_"))));
    }
}

#[test]
fn raising_threshold_only_refines() {
    let store = store_of(noisy_groups(16, 4, 15, 0.45));
    let pass = ClusterEngine::new(7, "cluster");
    let mut go = |_: lumen_identity::BlockProgress| std::ops::ControlFlow::Continue(());

    let thresholds = [0.3, 0.5, 0.65, 0.8, 0.95];
    let runs: Vec<BTreeMap<String, usize>> = thresholds
        .iter()
        .map(|&t| labels(&pass.cluster(&store, t, &mut go).unwrap()))
        .collect();
    let counts: Vec<usize> = runs
        .iter()
        .map(|r| r.values().collect::<BTreeSet<_>>().len())
        .collect();
    assert!(counts[0] < counts[2] && counts[2] < counts[4], "{counts:?}");

    for w in runs.windows(2) {
        let (low, high) = (&w[0], &w[1]);
        let ids: Vec<&String> = high.keys().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                if high[*a] == high[*b] {
                    assert_eq!(low[*a], low[*b], "{a} and {b} split at the lower threshold");
                }
            }
        }
    }
}

#[test]
fn block_size_does_not_change_the_partition() {
    let entities = noisy_groups(8, 3, 20, 0.4);
    let store = store_of(entities);
    let mut go = |_: lumen_identity::BlockProgress| std::ops::ControlFlow::Continue(());
    let whole = ClusterEngine::new(1000, "cluster")
        .cluster(&store, 0.7, &mut go)
        .unwrap();
    let blocked = ClusterEngine::new(3, "cluster")
        .cluster(&store, 0.7, &mut go)
        .unwrap();
    assert_eq!(whole, blocked);
}

#[test]
fn verified_members_stay_together_through_recluster() {
    let engine = engine_with(noisy_groups(16, 4, 10, 0.5));
    engine.cluster(0.6).unwrap();

    // Verify the first two members of every cluster that has two.
    let mut pinned: Vec<BTreeSet<String>> = Vec::new();
    for c in engine.get_clusters() {
        let ids: Vec<String> = c.members.iter().take(2).map(|m| m.id.clone()).collect();
        for id in &ids {
            engine.verify(id, &c.id, true).unwrap();
        }
        pinned.push(ids.into_iter().collect());
    }
    assert!(pinned.len() > 1);

    for threshold in [0.3, 0.6, 0.9] {
        engine.recluster(threshold).unwrap();
        for group in &pinned {
            let homes: BTreeSet<Option<String>> = group
                .iter()
                .map(|id| engine.get_entity(id).unwrap().cluster_id)
                .collect();
            assert_eq!(homes.len(), 1, "verified group {group:?} split");
            assert!(homes.iter().all(Option::is_some));
        }
        engine.verify_integrity().unwrap();
    }
}

#[test]
fn constraints_hold_after_every_operation() {
    let engine = engine_with(noisy_groups(16, 4, 10, 0.5));
    engine.cluster(0.55).unwrap();

    // Reject every third member of every cluster, twice over.
    for _ in 0..2 {
        for c in engine.get_clusters() {
            for m in c.members.iter().step_by(3) {
                if engine.get_entity(&m.id).unwrap().cluster_id.as_deref() == Some(&c.id) {
                    engine.verify(&m.id, &c.id, false).unwrap();
                }
            }
        }
        engine.verify_integrity().unwrap();
    }

    let check = |engine: &lumen_identity::Engine| {
        for c in engine.get_clusters() {
            for m in &c.members {
                assert!(
                    !engine.constraints(&m.id).contains(&c.id),
                    "{} sits in forbidden {}",
                    m.id,
                    c.id
                );
            }
        }
        engine.verify_integrity().unwrap();
    };

    engine.cluster(0.55).unwrap();
    check(&engine);

    let clusters = engine.get_clusters();
    engine
        .verify(&clusters[0].members[0].id, &clusters[0].id, true)
        .unwrap();
    engine.recluster(0.4).unwrap();
    check(&engine);

    let clusters = engine.get_clusters();
    if clusters.len() >= 2 {
        engine.merge(&clusters[1].id, &clusters[0].id).unwrap();
        check(&engine);
    }
}

#[test]
fn conservation_holds_across_a_session() {
    let entities = noisy_groups(16, 3, 8, 0.5);
    let total = entities.len();
    let engine = engine_with(entities);

    let conserved = |engine: &lumen_identity::Engine| {
        let placed: usize = engine.get_clusters().iter().map(|c| c.size).sum();
        assert_eq!(placed + orphans(engine).len(), total);
        let status = engine.status();
        assert_eq!(status.total_entities, total);
        engine.verify_integrity().unwrap();
    };

    conserved(&engine);
    engine.cluster(0.6).unwrap();
    conserved(&engine);

    let clusters = engine.get_clusters();
    let first = &clusters[0];
    engine.verify(&first.members[0].id, &first.id, true).unwrap();
    conserved(&engine);
    let outcome = engine
        .verify(&first.members[1].id, &first.id, false)
        .unwrap()
        .value;
    assert!(!matches!(outcome, VerifyOutcome::Verified));
    conserved(&engine);

    if clusters.len() >= 2 {
        engine.merge(&clusters[1].id, &first.id).unwrap();
        conserved(&engine);
    }
    engine.recluster(0.5).unwrap();
    conserved(&engine);
    engine.cluster(0.7).unwrap();
    conserved(&engine);
}
