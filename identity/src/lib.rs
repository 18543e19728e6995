//! Embedding clustering and identity resolution under human correction.
//!
//! Entities (detected faces, or whole images) are grouped into clusters by
//! cosine similarity of their embeddings. The grouping is then maintained as
//! a person corrects it: confirming members, rejecting them, merging and
//! naming clusters. Rejections become permanent constraints, and confirmed
//! members anchor later re-clustering passes.
//!
//! # Usage
//!
//! ```
//! use lumen_identity::{Config, Engine, Entity};
//!
//! let engine = Engine::in_memory(Config::default()).unwrap();
//! engine
//!     .add_entities(vec![
//!         Entity::new("a", "a.jpg", vec![1.0, 0.0]),
//!         Entity::new("b", "b.jpg", vec![0.95, 0.05]),
//!         Entity::new("c", "c.jpg", vec![0.0, 1.0]),
//!     ])
//!     .unwrap();
//!
//! // One-shot clustering: a and b end up together.
//! engine.cluster(0.65).unwrap();
//! let clusters = engine.get_clusters();
//! assert_eq!(clusters[0].id, "cluster_a");
//! assert_eq!(clusters[0].size, 2);
//!
//! // Confirm a, then re-cluster around it.
//! engine.verify("a", "cluster_a", true).unwrap();
//! engine.recluster(0.60).unwrap();
//! ```
//!
//! # Design
//!
//! A clustering pass unions every pair at or above the threshold, so classes
//! are the transitive closure of "similar enough". Cluster IDs derive from
//! the first member in entity order, so unchanged input yields unchanged IDs
//! and name bindings survive repeated passes.
//!
//! Re-homing a rejected entity, placing a new one and re-clustering all go
//! through one best-cluster search ([`find_best_cluster`]).

mod cluster;
mod config;
mod constraints;
mod correction;
mod engine;
mod entity;
mod error;
mod job;
mod persist;
mod recluster;
mod resolver;
mod scan;
mod state;
mod store;
mod unionfind;
mod vector;

pub use cluster::{BlockProgress, Class, ClusterEngine, ClusterId, cluster_id};
pub use config::{Config, check_threshold};
pub use constraints::ConstraintSet;
pub use correction::{MergeOutcome, VerifyOutcome};
pub use engine::{
    Applied, ClusterReport, ClusterView, DuplicateGroup, Engine, EntitySummary, IngestReport,
    Match, Status,
};
pub use entity::{Entity, EntityId, EntityStore, Region, entity_id};
pub use error::{ErrorKind, IdentityError, IdentityResult, Missing};
pub use job::{JobKind, JobOutcome, JobStatus};
pub use persist::{LAYOUT_VERSION, LoadReport};
pub use recluster::ReclusterStats;
pub use resolver::{CentroidPolicy, Candidate, Placement, find_best_cluster};
pub use scan::{Detection, EmbedError, Embedder, ScanOptions, ScanReport};
pub use store::{DirStore, MemoryStore, RedbStore, Section, SectionStore, StoreError};
pub use vector::{centroid, cosine_sim, l2_norm, normalized};
