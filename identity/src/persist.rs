//! Section codecs and state loading.
//!
//! Entities, orphans and scanned sources are MessagePack; names and
//! constraints are JSON so they stay hand-editable. Every section is wrapped
//! in an envelope carrying [`LAYOUT_VERSION`].
//!
//! Entity records are decoded one at a time: a record that does not decode
//! is skipped and counted instead of failing the whole load.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::ClusterId;
use crate::constraints::ConstraintSet;
use crate::entity::{Entity, EntityId};
use crate::state::{Cluster, EngineState, Partition};
use crate::store::{Section, SectionStore, StoreError};

/// Version written into every section envelope.
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct EntityRecord {
    entity: Entity,
    #[serde(default)]
    cluster: Option<ClusterId>,
}

#[derive(Serialize)]
struct EntitiesOut<'a> {
    version: u32,
    /// Cluster IDs in presentation order.
    clusters: Vec<&'a str>,
    records: Vec<EntityRecord>,
}

#[derive(Deserialize)]
struct EntitiesIn {
    #[serde(default)]
    clusters: Vec<ClusterId>,
    #[serde(default)]
    records: Vec<rmpv::Value>,
}

#[derive(Serialize, Deserialize)]
struct IdList {
    version: u32,
    items: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Names {
    version: u32,
    names: BTreeMap<ClusterId, String>,
}

#[derive(Serialize, Deserialize)]
struct Constraints {
    version: u32,
    constraints: ConstraintSet,
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

/// Serialization format of a section.
#[derive(Clone, Copy)]
enum Format {
    MsgPack,
    Json,
}

fn format_of(section: Section) -> Format {
    match section {
        Section::Names | Section::Constraints => Format::Json,
        Section::Entities | Section::Orphans | Section::Scanned => Format::MsgPack,
    }
}

fn encode_value<T: Serialize>(section: Section, value: &T) -> Result<Vec<u8>, StoreError> {
    let res = match format_of(section) {
        Format::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        Format::Json => serde_json::to_vec_pretty(value).map_err(|e| e.to_string()),
    };
    res.map_err(|message| StoreError::Encode { section, message })
}

fn decode_value<T: DeserializeOwned>(section: Section, data: &[u8]) -> Result<T, StoreError> {
    let res = match format_of(section) {
        Format::MsgPack => rmp_serde::from_slice(data).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
    };
    res.map_err(|message| StoreError::Decode { section, message })
}

/// Decodes a section after checking its layout version.
fn decode_versioned<T: DeserializeOwned>(section: Section, data: &[u8]) -> Result<T, StoreError> {
    let header: Header = decode_value(section, data)?;
    if header.version != LAYOUT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            section,
            found: header.version,
        });
    }
    decode_value(section, data)
}

/// Encodes one section of `state`.
pub fn encode(state: &EngineState, section: Section) -> Result<Vec<u8>, StoreError> {
    match section {
        Section::Entities => {
            let partition = &state.partition;
            let records = state
                .entities
                .iter()
                .map(|e| EntityRecord {
                    entity: e.clone(),
                    cluster: partition.cluster_of(&e.id).cloned(),
                })
                .collect();
            let out = EntitiesOut {
                version: LAYOUT_VERSION,
                clusters: partition.clusters().iter().map(|c| c.id.as_str()).collect(),
                records,
            };
            encode_value(section, &out)
        }
        Section::Orphans => encode_value(
            section,
            &IdList {
                version: LAYOUT_VERSION,
                items: state.partition.orphans().iter().cloned().collect(),
            },
        ),
        Section::Scanned => encode_value(
            section,
            &IdList {
                version: LAYOUT_VERSION,
                items: state.scanned.iter().cloned().collect(),
            },
        ),
        Section::Names => encode_value(
            section,
            &Names {
                version: LAYOUT_VERSION,
                names: state.names.clone(),
            },
        ),
        Section::Constraints => encode_value(
            section,
            &Constraints {
                version: LAYOUT_VERSION,
                constraints: state.constraints.clone(),
            },
        ),
    }
}

/// What happened while loading a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub entities: usize,
    pub clusters: usize,
    pub orphans: usize,
    /// Entity records that could not be decoded or inserted.
    pub skipped_records: usize,
    /// Members moved to the orphan set because a constraint forbids their
    /// cluster.
    pub evicted: usize,
    /// Name bindings dropped because their cluster is gone.
    pub pruned_names: usize,
}

impl LoadReport {
    /// True if loading changed anything relative to what was stored.
    pub fn repaired(&self) -> bool {
        self.skipped_records > 0 || self.evicted > 0 || self.pruned_names > 0
    }
}

/// Rebuilds engine state from `store`.
///
/// Missing sections load as empty. A section whose envelope does not decode,
/// or that carries an unknown layout version, fails the load.
pub fn load_state(
    store: &dyn SectionStore,
    dim: usize,
) -> Result<(EngineState, LoadReport), StoreError> {
    let mut state = EngineState::new(dim);
    let mut report = LoadReport::default();

    let mut assigned: BTreeMap<ClusterId, BTreeSet<EntityId>> = BTreeMap::new();
    let mut order: Vec<ClusterId> = Vec::new();
    let mut unplaced: BTreeSet<EntityId> = BTreeSet::new();

    if let Some(data) = store.load(Section::Entities)? {
        let section: EntitiesIn = decode_versioned(Section::Entities, &data)?;
        order = section.clusters;
        for (i, value) in section.records.into_iter().enumerate() {
            let record: EntityRecord = match rmpv::ext::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    warn!("persist: skipping entity record {i}: {e}");
                    report.skipped_records += 1;
                    continue;
                }
            };
            let id = record.entity.id.clone();
            if let Err(e) = state.entities.insert(record.entity) {
                warn!("persist: skipping entity record {i} ({id}): {e}");
                report.skipped_records += 1;
                continue;
            }
            match record.cluster {
                Some(cid) => {
                    assigned.entry(cid).or_default().insert(id);
                }
                None => {
                    unplaced.insert(id);
                }
            }
        }
    }

    if let Some(data) = store.load(Section::Orphans)? {
        let list: IdList = decode_versioned(Section::Orphans, &data)?;
        let listed: BTreeSet<EntityId> = list.items.into_iter().collect();
        let unlisted = unplaced.difference(&listed).count();
        let stale = listed
            .iter()
            .filter(|id| !unplaced.contains(*id))
            .count();
        if unlisted > 0 || stale > 0 {
            debug!(
                "persist: orphan list disagrees with entity records ({unlisted} unlisted, {stale} stale)"
            );
        }
    }

    if let Some(data) = store.load(Section::Scanned)? {
        let list: IdList = decode_versioned(Section::Scanned, &data)?;
        state.scanned = list.items.into_iter().collect();
    }
    if let Some(data) = store.load(Section::Names)? {
        let names: Names = decode_versioned(Section::Names, &data)?;
        state.names = names.names;
    }
    if let Some(data) = store.load(Section::Constraints)? {
        let c: Constraints = decode_versioned(Section::Constraints, &data)?;
        state.constraints = c.constraints;
    }

    // Saved order first, then any cluster the order list does not know.
    let mut clusters: Vec<Cluster> = Vec::with_capacity(assigned.len());
    for id in order {
        if let Some(members) = assigned.remove(&id) {
            clusters.push(Cluster { id, members });
        }
    }
    clusters.extend(
        assigned
            .into_iter()
            .map(|(id, members)| Cluster { id, members }),
    );

    for c in &mut clusters {
        let constraints = &state.constraints;
        let before = c.members.len();
        let evicted: Vec<EntityId> = c
            .members
            .iter()
            .filter(|m| constraints.forbids(m, &c.id))
            .cloned()
            .collect();
        for m in evicted {
            c.members.remove(&m);
            unplaced.insert(m);
        }
        report.evicted += before - c.members.len();
    }

    for id in &unplaced {
        state.entities.set_verified(id, false);
    }
    state.partition = Partition::from_parts(clusters, unplaced);
    let before = state.names.len();
    state.prune_names();
    report.pruned_names = before - state.names.len();

    report.entities = state.entities.len();
    report.clusters = state.partition.clusters().len();
    report.orphans = state.partition.orphans().len();
    if report.evicted > 0 {
        warn!(
            "persist: moved {} constrained members to orphans",
            report.evicted
        );
    }
    info!(
        "persist: loaded {} entities, {} clusters, {} orphans ({} records skipped)",
        report.entities, report.clusters, report.orphans, report.skipped_records
    );
    Ok((state, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cluster(id: &str, members: &[&str]) -> Cluster {
        Cluster {
            id: id.to_string(),
            members: members.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn sample() -> EngineState {
        let mut s = EngineState::new(0);
        for (id, v) in [("a", [1.0, 0.0]), ("b", [0.9, 0.1]), ("c", [0.0, 1.0]), ("d", [0.5, 0.5])] {
            s.entities
                .insert(Entity::new(id, format!("{id}.jpg"), v.to_vec()))
                .unwrap();
        }
        s.entities.set_verified("a", true);
        s.partition = Partition::from_parts(
            vec![cluster("cluster_c", &["c"]), cluster("cluster_a", &["a", "b"])],
            ["d".to_string()].into_iter().collect(),
        );
        s.names.insert("cluster_a".into(), "Alice".into());
        s.constraints.add("c", "cluster_a");
        s.scanned.insert("a.jpg".into());
        s
    }

    fn save_all(state: &EngineState, store: &MemoryStore) {
        for section in Section::ALL {
            store.save(section, &encode(state, section).unwrap()).unwrap();
        }
    }

    #[test]
    fn round_trip_preserves_state() {
        let state = sample();
        let store = MemoryStore::new();
        save_all(&state, &store);

        let (loaded, report) = load_state(&store, 0).unwrap();
        assert!(!report.repaired());
        assert_eq!(report.entities, 4);
        assert_eq!(loaded.entities.dim(), 2);
        assert!(loaded.entities.is_verified("a"));

        let ids: Vec<&str> = loaded.partition.clusters().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cluster_a", "cluster_c"]);
        assert!(loaded.partition.is_orphan("d"));
        assert_eq!(loaded.names.get("cluster_a").map(String::as_str), Some("Alice"));
        assert!(loaded.constraints.forbids("c", "cluster_a"));
        assert!(loaded.scanned.contains("a.jpg"));
        loaded.check().unwrap();
    }

    #[test]
    fn empty_store_loads_empty_state() {
        let (state, report) = load_state(&MemoryStore::new(), 8).unwrap();
        assert!(state.entities.is_empty());
        assert_eq!(state.entities.dim(), 8);
        assert_eq!(report, LoadReport::default());
    }

    #[test]
    fn names_and_constraints_are_readable_json() {
        let state = sample();
        let names = encode(&state, Section::Names).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&names).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["names"]["cluster_a"], "Alice");

        let constraints = encode(&state, Section::Constraints).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&constraints).unwrap();
        assert_eq!(v["constraints"]["c"][0], "cluster_a");
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let state = sample();
        let data = encode(&state, Section::Entities).unwrap();
        let mut value: rmpv::Value = rmp_serde::from_slice(&data).unwrap();

        // Replace the second record with garbage.
        let rmpv::Value::Map(map) = &mut value else {
            panic!("entities section is not a map");
        };
        for (k, v) in map.iter_mut() {
            if k.as_str() == Some("records") {
                if let rmpv::Value::Array(records) = v {
                    records[1] = rmpv::Value::from("not a record");
                }
            }
        }
        let mut corrupt = Vec::new();
        rmpv::encode::write_value(&mut corrupt, &value).unwrap();

        let store = MemoryStore::new();
        save_all(&state, &store);
        store.save(Section::Entities, &corrupt).unwrap();

        let (loaded, report) = load_state(&store, 0).unwrap();
        assert_eq!(report.skipped_records, 1);
        assert_eq!(loaded.entities.len(), 3);
        assert!(!loaded.entities.contains("b"));
        loaded.check().unwrap();
    }

    #[test]
    fn unknown_version_fails() {
        let store = MemoryStore::new();
        store
            .save(Section::Names, br#"{"version": 7, "names": {}}"#)
            .unwrap();
        let Err(err) = load_state(&store, 0) else {
            panic!("version 7 must not load");
        };
        assert!(matches!(
            err,
            StoreError::UnsupportedVersion {
                section: Section::Names,
                found: 7
            }
        ));
    }

    #[test]
    fn garbage_envelope_fails() {
        let store = MemoryStore::new();
        store.save(Section::Entities, b"\xc1\xc1\xc1").unwrap();
        let Err(err) = load_state(&store, 0) else {
            panic!("garbage must not load");
        };
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[test]
    fn load_repairs_constraint_violations() {
        let mut state = sample();
        state.constraints.add("b", "cluster_a");
        state.names.insert("cluster_gone".into(), "Ghost".into());
        let store = MemoryStore::new();
        save_all(&state, &store);

        let (loaded, report) = load_state(&store, 0).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.pruned_names, 1);
        assert!(loaded.partition.is_orphan("b"));
        loaded.check().unwrap();
    }
}
