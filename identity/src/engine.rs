//! The identity engine: one instance per data directory.
//!
//! All state lives behind a single [`RwLock`]. Structural mutations are
//! serialized against each other; queries read a consistent snapshot and
//! never observe a half-applied change. Long passes (cluster, recluster,
//! scan) compute under an upgradable read lock, so queries keep working
//! while they run, and upgrade to a write lock only to apply their result.
//!
//! Persistence is write-through. After a mutation is applied the write lock
//! is downgraded and every touched section is saved. A section that fails to
//! save stays dirty and is retried by the next mutation or by
//! [`Engine::flush`]; the mutation itself still succeeds and reports the
//! section in [`Applied::pending`].

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::{BlockProgress, Class, ClusterEngine, ClusterId};
use crate::config::{Config, check_threshold};
use crate::correction::{self, MergeOutcome, VerifyOutcome, place_all};
use crate::entity::{Entity, EntityId, Region, entity_id};
use crate::error::{IdentityError, IdentityResult};
use crate::job::{JobGuard, JobKind, JobOutcome, JobStatus, Jobs};
use crate::persist::{LoadReport, encode, load_state};
use crate::recluster::{self, ReclusterStats};
use crate::scan::{Detection, Embedder, ScanOptions, ScanReport};
use crate::state::{Cluster, EngineState, Partition};
use crate::store::{MemoryStore, Section, SectionStore, StoreError};
use crate::vector::{dot, normalized};

/// A mutation that took effect in memory.
///
/// `pending` lists sections that could not be saved yet. Empty means the
/// change is durable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied<T> {
    pub value: T,
    pub pending: Vec<Section>,
}

impl<T> Applied<T> {
    pub fn is_durable(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What a clustering pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterReport {
    pub entities: usize,
    pub clusters: usize,
    pub orphans: usize,
    /// Size of the biggest cluster.
    pub largest: usize,
    /// Members that landed in a cluster they are constrained against and
    /// were moved out.
    pub evicted: usize,
    /// Name bindings dropped because their cluster did not survive.
    pub pruned_names: usize,
}

/// Result of adding entities directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub added: usize,
    /// Placed into an existing cluster.
    pub placed: usize,
    pub orphaned: usize,
}

/// An entity as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub source: String,
    pub verified: bool,
    pub cluster_id: Option<ClusterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// A cluster as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterView {
    pub id: ClusterId,
    /// Custom name, or the positional default.
    pub name: String,
    pub custom_name: bool,
    pub size: usize,
    pub verified: usize,
    pub members: Vec<EntitySummary>,
}

/// A group of near-identical entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    /// First member in entity order.
    pub canonical: EntityId,
    pub members: Vec<EntitySummary>,
}

/// One similarity search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub entity_id: EntityId,
    pub source: String,
    pub cluster_id: Option<ClusterId>,
    pub similarity: f32,
}

/// Engine status for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub job: JobStatus,
    pub total_entities: usize,
    pub verified_entities: usize,
    pub total_clusters: usize,
    pub total_orphans: usize,
    pub constraint_pairs: usize,
    pub scanned_sources: usize,
    pub pending_sections: Vec<Section>,
}

/// Clusters entities by embedding similarity and keeps the clustering
/// consistent under human correction.
///
/// Thread-safe: all methods can be called concurrently.
pub struct Engine {
    config: Config,
    state: RwLock<EngineState>,
    store: Box<dyn SectionStore>,
    dirty: Mutex<BTreeSet<Section>>,
    jobs: Jobs,
    load_report: LoadReport,
}

impl Engine {
    /// Opens an engine over `store`, loading whatever it holds.
    pub fn open(config: Config, store: Box<dyn SectionStore>) -> IdentityResult<Self> {
        config.validate()?;
        let (state, load_report) = load_state(store.as_ref(), config.dim)?;
        let engine = Self {
            config,
            state: RwLock::new(state),
            store,
            dirty: Mutex::new(BTreeSet::new()),
            jobs: Jobs::default(),
            load_report,
        };
        if engine.load_report.repaired() {
            let state = engine.state.read();
            let pending = engine.persist(
                &state,
                &[Section::Entities, Section::Orphans, Section::Names],
            );
            if !pending.is_empty() {
                warn!("engine: repaired state not saved: {pending:?}");
            }
        }
        Ok(engine)
    }

    /// Creates an engine that keeps nothing across restarts.
    pub fn in_memory(config: Config) -> IdentityResult<Self> {
        Self::open(config, Box::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What happened when the store was loaded.
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn save_dirty(
        &self,
        state: &EngineState,
        touched: &[Section],
    ) -> (Vec<Section>, Option<StoreError>) {
        let mut dirty = self.dirty.lock();
        dirty.extend(touched.iter().copied());
        let mut pending = Vec::new();
        let mut last_err = None;
        for &section in dirty.iter() {
            let saved = encode(state, section).and_then(|data| self.store.save(section, &data));
            if let Err(e) = saved {
                warn!("engine: save {section} failed: {e}");
                pending.push(section);
                last_err = Some(e);
            }
        }
        *dirty = pending.iter().copied().collect();
        (pending, last_err)
    }

    fn persist(&self, state: &EngineState, touched: &[Section]) -> Vec<Section> {
        self.save_dirty(state, touched).0
    }

    /// Retries every section that failed to save.
    pub fn flush(&self) -> IdentityResult<()> {
        let state = self.state.read();
        match self.save_dirty(&state, &[]) {
            (_, Some(e)) => Err(e.into()),
            (_, None) => Ok(()),
        }
    }

    /// Sections waiting to be saved.
    pub fn pending_sections(&self) -> Vec<Section> {
        self.dirty.lock().iter().copied().collect()
    }

    /// Applies `f` under the write lock, then persists what it touched.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut EngineState) -> IdentityResult<(T, Vec<Section>)>,
    ) -> IdentityResult<Applied<T>> {
        let mut state = self.state.write();
        let (value, touched) = f(&mut state)?;
        let state = RwLockWriteGuard::downgrade(state);
        let pending = self.persist(&state, &touched);
        Ok(Applied { value, pending })
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Adds entities and places each one into the best existing cluster at
    /// the rehome threshold, or into the orphan set.
    ///
    /// All-or-nothing: a duplicate ID or dimension mismatch anywhere in the
    /// batch rejects the whole batch. New entities start unverified.
    pub fn add_entities(&self, entities: Vec<Entity>) -> IdentityResult<Applied<IngestReport>> {
        let threshold = self.config.rehome_threshold;
        self.mutate(|state| {
            let mut dim = state.entities.dim();
            let mut seen: HashSet<&str> = HashSet::new();
            for e in &entities {
                if e.embedding.is_empty() {
                    return Err(IdentityError::InvalidArgument(format!(
                        "entity {} has an empty embedding",
                        e.id
                    )));
                }
                if dim == 0 {
                    dim = e.embedding.len();
                } else if e.embedding.len() != dim {
                    return Err(IdentityError::DimensionMismatch {
                        expected: dim,
                        got: e.embedding.len(),
                    });
                }
                if state.entities.contains(&e.id) || !seen.insert(&e.id) {
                    return Err(IdentityError::InvalidArgument(format!(
                        "duplicate entity id {}",
                        e.id
                    )));
                }
            }

            let mut ids = Vec::with_capacity(entities.len());
            for mut e in entities {
                e.verified = false;
                ids.push(e.id.clone());
                state.entities.insert(e)?;
            }
            let placed = place_all(state, &ids, &[], threshold);
            debug!(
                "engine: added {} entities ({} placed)",
                ids.len(),
                placed.rehomed.len()
            );
            let report = IngestReport {
                added: ids.len(),
                placed: placed.rehomed.len(),
                orphaned: placed.orphaned.len(),
            };
            Ok((report, vec![Section::Entities, Section::Orphans]))
        })
    }

    /// Deletes an entity. An emptied cluster is deleted with its name.
    /// Constraints recorded for the entity are kept.
    pub fn delete_entity(&self, entity_id: &str) -> IdentityResult<Applied<()>> {
        self.mutate(|state| {
            if !state.entities.contains(entity_id) {
                return Err(IdentityError::entity(entity_id));
            }
            let mut touched = vec![Section::Entities, Section::Orphans];
            if let Some(cid) = state.partition.detach(entity_id) {
                if state.delete_if_empty(&cid) {
                    touched.push(Section::Names);
                }
            }
            state.entities.remove(entity_id);
            debug!("engine: deleted entity {entity_id}");
            Ok(((), touched))
        })
    }

    /// How many of `sources` have not been scanned yet.
    pub fn new_sources_count(&self, sources: &[String]) -> usize {
        let state = self.state.read();
        sources
            .iter()
            .map(String::as_str)
            .collect::<HashSet<&str>>()
            .into_iter()
            .filter(|s| !state.scanned.contains(*s))
            .count()
    }

    /// Embeds `sources` and clusters the result. Blocks until done.
    pub fn scan(
        &self,
        sources: &[String],
        embedder: &dyn Embedder,
        opts: ScanOptions,
    ) -> IdentityResult<Applied<ScanReport>> {
        self.jobs.begin(JobKind::Scan)?;
        self.run(
            |job| self.scan_pass(job, sources, embedder, opts),
            |a| JobOutcome::Scanned(a.value.clone()),
        )
    }

    /// Like [`Engine::scan`], on a background thread.
    pub fn start_scan(
        self: &Arc<Self>,
        sources: Vec<String>,
        embedder: Arc<dyn Embedder>,
        opts: ScanOptions,
    ) -> IdentityResult<JoinHandle<IdentityResult<Applied<ScanReport>>>> {
        self.jobs.begin(JobKind::Scan)?;
        let engine = Arc::clone(self);
        Ok(thread::spawn(move || {
            engine.run(
                |job| engine.scan_pass(job, &sources, embedder.as_ref(), opts),
                |a| JobOutcome::Scanned(a.value.clone()),
            )
        }))
    }

    fn scan_pass(
        &self,
        job: &JobGuard<'_>,
        sources: &[String],
        embedder: &dyn Embedder,
        opts: ScanOptions,
    ) -> IdentityResult<Applied<ScanReport>> {
        let mut report = ScanReport::default();
        let mut pending = Vec::new();

        if !opts.incremental {
            job.phase("resetting");
            let mut state = self.state.write();
            state.entities.clear();
            state.partition.clear();
            state.scanned.clear();
            state.names.clear();
            let state = RwLockWriteGuard::downgrade(state);
            pending = self.persist(
                &state,
                &[
                    Section::Entities,
                    Section::Orphans,
                    Section::Scanned,
                    Section::Names,
                ],
            );
        }

        let mut todo: Vec<&str> = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            let mut todo = Vec::new();
            for s in sources {
                if !seen.insert(s.as_str()) {
                    continue;
                }
                if opts.incremental && state.scanned.contains(s) {
                    report.sources_skipped += 1;
                } else {
                    todo.push(s.as_str());
                }
            }
            todo
        };
        if opts.limit > 0 {
            todo.truncate(opts.limit);
        }

        job.phase("extracting");
        let total = todo.len();
        let batch_size = self.config.scan_batch_size;
        let mut batch: Vec<(String, Vec<Detection>)> = Vec::new();
        for (i, source) in todo.into_iter().enumerate() {
            match embedder.extract(source) {
                Ok(detections) => batch.push((source.to_string(), detections)),
                Err(e) => {
                    warn!("scan: {source}: {e}");
                    report.sources_failed += 1;
                }
            }
            report.sources_scanned += 1;
            job.count(i + 1, total);

            let stop = job.stop_requested();
            if !batch.is_empty() && (stop || (i + 1) % batch_size == 0 || i + 1 == total) {
                pending = self.commit_batch(std::mem::take(&mut batch), &mut report);
            }
            if stop {
                report.cancelled = true;
                break;
            }
        }

        if report.cancelled {
            info!(
                "scan: cancelled after {} sources ({} entities added)",
                report.sources_scanned, report.entities_added
            );
            return Ok(Applied {
                value: report,
                pending,
            });
        }

        match self.cluster_pass(job, self.config.threshold) {
            Ok(applied) => {
                report.clusters = Some(applied.value.clusters);
                pending = applied.pending;
            }
            Err(IdentityError::Cancelled) => report.cancelled = true,
            Err(e) => return Err(e),
        }
        info!(
            "scan: {} sources scanned, {} skipped, {} failed, {} entities added",
            report.sources_scanned,
            report.sources_skipped,
            report.sources_failed,
            report.entities_added
        );
        Ok(Applied {
            value: report,
            pending,
        })
    }

    /// Stores a batch of extraction results and places the new entities.
    fn commit_batch(
        &self,
        batch: Vec<(String, Vec<Detection>)>,
        report: &mut ScanReport,
    ) -> Vec<Section> {
        let mut state = self.state.write();
        let mut ids = Vec::new();
        for (source, detections) in batch {
            for det in detections {
                let id = entity_id(&source, det.region.as_ref());
                if state.entities.contains(&id) {
                    debug!("scan: {source}: entity {id} already known");
                    continue;
                }
                let mut entity = Entity::new(id.clone(), source.clone(), det.embedding);
                entity.region = det.region;
                entity.confidence = det.confidence;
                entity.thumbnail = det.thumbnail;
                match state.entities.insert(entity) {
                    Ok(()) => ids.push(id),
                    Err(e) => warn!("scan: {source}: {e}"),
                }
            }
            state.scanned.insert(source);
        }
        let placed = place_all(&mut state, &ids, &[], self.config.rehome_threshold);
        report.entities_added += ids.len();
        report.placed_online += placed.rehomed.len();
        debug!(
            "scan: committed {} entities ({} placed)",
            ids.len(),
            placed.rehomed.len()
        );

        let state = RwLockWriteGuard::downgrade(state);
        self.persist(
            &state,
            &[Section::Entities, Section::Orphans, Section::Scanned],
        )
    }

    // ------------------------------------------------------------------
    // Clustering
    // ------------------------------------------------------------------

    /// Runs a job slot claimed with `Jobs::begin` and records its outcome.
    fn run<T>(
        &self,
        work: impl FnOnce(&JobGuard<'_>) -> IdentityResult<T>,
        outcome: impl FnOnce(&T) -> JobOutcome,
    ) -> IdentityResult<T> {
        let job = self.jobs.adopt();
        let result = work(&job);
        let end = match &result {
            Ok(v) => outcome(v),
            Err(IdentityError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed {
                message: e.to_string(),
            },
        };
        job.finish(end);
        result
    }

    /// Clusters every entity from scratch. Blocks until done.
    ///
    /// Custom names survive for every cluster whose ID is unchanged.
    pub fn cluster(&self, threshold: f32) -> IdentityResult<Applied<ClusterReport>> {
        check_threshold(threshold)?;
        self.jobs.begin(JobKind::Cluster)?;
        self.run(
            |job| self.cluster_pass(job, threshold),
            |a| JobOutcome::Clustered(a.value.clone()),
        )
    }

    /// Like [`Engine::cluster`], on a background thread.
    pub fn start_cluster(
        self: &Arc<Self>,
        threshold: f32,
    ) -> IdentityResult<JoinHandle<IdentityResult<Applied<ClusterReport>>>> {
        check_threshold(threshold)?;
        self.jobs.begin(JobKind::Cluster)?;
        let engine = Arc::clone(self);
        Ok(thread::spawn(move || {
            engine.run(
                |job| engine.cluster_pass(job, threshold),
                |a| JobOutcome::Clustered(a.value.clone()),
            )
        }))
    }

    fn cluster_pass(
        &self,
        job: &JobGuard<'_>,
        threshold: f32,
    ) -> IdentityResult<Applied<ClusterReport>> {
        job.phase("clustering");
        let pass = ClusterEngine::new(self.config.block_size, self.config.id_prefix.clone());

        let state = self.state.upgradable_read();
        let classes = pass.cluster(&state.entities, threshold, &mut |p: BlockProgress| {
            job.report(p.fraction(), p.rows_done, p.rows_total);
            if job.stop_requested() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let report = apply_classes(&mut state, classes, self.config.rehome_threshold);
        let state = RwLockWriteGuard::downgrade(state);
        let pending = self.persist(
            &state,
            &[Section::Entities, Section::Orphans, Section::Names],
        );
        info!(
            "engine: clustered {} entities into {} clusters at {threshold} ({} orphans, {} evicted)",
            report.entities, report.clusters, report.orphans, report.evicted
        );
        Ok(Applied {
            value: report,
            pending,
        })
    }

    /// Re-derives the clustering around verified anchors. Blocks until done.
    ///
    /// Fails with `InvalidState`, changing nothing, when no entity is
    /// verified.
    pub fn recluster(&self, threshold: f32) -> IdentityResult<Applied<ReclusterStats>> {
        check_threshold(threshold)?;
        self.jobs.begin(JobKind::Recluster)?;
        self.run(
            |job| self.recluster_pass(job, threshold),
            |a| JobOutcome::Reclustered(a.value.clone()),
        )
    }

    /// Like [`Engine::recluster`], on a background thread.
    pub fn start_recluster(
        self: &Arc<Self>,
        threshold: f32,
    ) -> IdentityResult<JoinHandle<IdentityResult<Applied<ReclusterStats>>>> {
        check_threshold(threshold)?;
        self.jobs.begin(JobKind::Recluster)?;
        let engine = Arc::clone(self);
        Ok(thread::spawn(move || {
            engine.run(
                |job| engine.recluster_pass(job, threshold),
                |a| JobOutcome::Reclustered(a.value.clone()),
            )
        }))
    }

    fn recluster_pass(
        &self,
        job: &JobGuard<'_>,
        threshold: f32,
    ) -> IdentityResult<Applied<ReclusterStats>> {
        job.phase("reclustering");
        let state = self.state.upgradable_read();
        let plan = recluster::plan(&state, threshold, &mut |done: usize, total: usize| {
            job.count(done, total);
            if job.stop_requested() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        job.count(plan.processed, plan.processed);

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.partition = plan.partition;
        for id in &plan.dropped {
            state.names.remove(id);
        }
        state.prune_names();
        let state = RwLockWriteGuard::downgrade(state);
        let pending = self.persist(
            &state,
            &[Section::Entities, Section::Orphans, Section::Names],
        );
        let stats = plan.stats;
        info!(
            "engine: reclustered at {threshold}: {} moved, {} orphaned, {} orphans placed, {} -> {} clusters",
            stats.moved,
            stats.newly_orphaned,
            stats.orphans_placed,
            stats.clusters_before,
            stats.clusters_after
        );
        Ok(Applied {
            value: stats,
            pending,
        })
    }

    /// Groups of near-identical entities. Read-only.
    pub fn find_duplicates(&self, threshold: f32) -> IdentityResult<Vec<DuplicateGroup>> {
        check_threshold(threshold)?;
        let pass = ClusterEngine::new(self.config.block_size, self.config.id_prefix.clone());
        let state = self.state.read();
        let classes = pass.cluster(&state.entities, threshold, &mut |_: BlockProgress| {
            ControlFlow::Continue(())
        })?;
        Ok(classes
            .into_iter()
            .filter(|c| c.members.len() >= 2)
            .map(|c| DuplicateGroup {
                canonical: c.members[0].clone(),
                members: c
                    .members
                    .iter()
                    .filter_map(|m| summary(&state, m))
                    .collect(),
            })
            .collect())
    }

    /// The `top_k` entities most similar to `query`, best first.
    pub fn search(&self, query: &[f32], top_k: usize) -> IdentityResult<Vec<Match>> {
        if top_k == 0 {
            return Err(IdentityError::InvalidArgument("top_k must be positive".into()));
        }
        let state = self.state.read();
        state.entities.check_dim(query)?;
        let q = normalized(query);
        let mut matches: Vec<Match> = state
            .entities
            .units()
            .map(|(e, unit)| Match {
                entity_id: e.id.clone(),
                source: e.source.clone(),
                cluster_id: state.partition.cluster_of(&e.id).cloned(),
                similarity: dot(&q, unit),
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(top_k);
        Ok(matches)
    }

    // ------------------------------------------------------------------
    // Corrections
    // ------------------------------------------------------------------

    /// Confirms (`accept`) or rejects an entity's membership in a cluster.
    pub fn verify(
        &self,
        entity_id: &str,
        cluster_id: &str,
        accept: bool,
    ) -> IdentityResult<Applied<VerifyOutcome>> {
        let threshold = self.config.rehome_threshold;
        let applied = self.mutate(|state| {
            correction::verify(state, entity_id, cluster_id, accept, threshold)
        })?;
        debug!(
            "engine: verify {entity_id} in {cluster_id} (accept={accept}): {:?}",
            applied.value
        );
        Ok(applied)
    }

    /// Moves every member of `source_id` into `target_id`.
    pub fn merge(&self, source_id: &str, target_id: &str) -> IdentityResult<Applied<MergeOutcome>> {
        let threshold = self.config.rehome_threshold;
        let applied =
            self.mutate(|state| correction::merge(state, source_id, target_id, threshold))?;
        debug!(
            "engine: merged {source_id} into {target_id} ({} moved)",
            applied.value.moved
        );
        Ok(applied)
    }

    /// Binds a display name to a cluster.
    pub fn rename(&self, cluster_id: &str, name: &str) -> IdentityResult<Applied<String>> {
        self.mutate(|state| {
            let name = correction::rename(state, cluster_id, name)?;
            Ok((name, vec![Section::Names]))
        })
    }

    /// Drops every constraint. Returns how many (entity, cluster) pairs
    /// were dropped.
    pub fn clear_constraints(&self) -> IdentityResult<Applied<usize>> {
        self.mutate(|state| {
            let n = state.constraints.pair_count();
            state.constraints.clear();
            info!("engine: cleared {n} constraints");
            Ok((n, vec![Section::Constraints]))
        })
    }

    /// Drops everything and removes every stored section.
    pub fn clear_all(&self) -> IdentityResult<Applied<()>> {
        if self.jobs.is_running() {
            return Err(IdentityError::InvalidState(
                "a job is running; stop it first".into(),
            ));
        }
        let mut state = self.state.write();
        *state = EngineState::new(self.config.dim);
        let _state = RwLockWriteGuard::downgrade(state);

        let mut dirty = self.dirty.lock();
        dirty.clear();
        let mut pending = Vec::new();
        for section in Section::ALL {
            if let Err(e) = self.store.remove(section) {
                warn!("engine: remove {section} failed: {e}");
                dirty.insert(section);
                pending.push(section);
            }
        }
        info!("engine: cleared all data");
        Ok(Applied { value: (), pending })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Every cluster in presentation order (largest first).
    pub fn get_clusters(&self) -> Vec<ClusterView> {
        let state = self.state.read();
        state
            .partition
            .clusters()
            .iter()
            .enumerate()
            .map(|(pos, c)| cluster_view(&state, c, pos, &self.config.name_prefix))
            .collect()
    }

    pub fn get_cluster(&self, cluster_id: &str) -> IdentityResult<ClusterView> {
        let state = self.state.read();
        let pos = state
            .partition
            .position(cluster_id)
            .ok_or_else(|| IdentityError::cluster(cluster_id))?;
        let c = &state.partition.clusters()[pos];
        Ok(cluster_view(&state, c, pos, &self.config.name_prefix))
    }

    pub fn get_orphans(&self) -> Vec<EntitySummary> {
        let state = self.state.read();
        state
            .partition
            .orphans()
            .iter()
            .filter_map(|id| summary(&state, id))
            .collect()
    }

    pub fn get_entity(&self, entity_id: &str) -> IdentityResult<EntitySummary> {
        let state = self.state.read();
        summary(&state, entity_id).ok_or_else(|| IdentityError::entity(entity_id))
    }

    /// Clusters `entity_id` may never join.
    pub fn constraints(&self, entity_id: &str) -> BTreeSet<ClusterId> {
        self.state.read().constraints.get(entity_id)
    }

    pub fn status(&self) -> Status {
        let job = self.jobs.snapshot();
        let state = self.state.read();
        Status {
            job,
            total_entities: state.entities.len(),
            verified_entities: state.entities.iter().filter(|e| e.verified).count(),
            total_clusters: state.partition.clusters().len(),
            total_orphans: state.partition.orphans().len(),
            constraint_pairs: state.constraints.pair_count(),
            scanned_sources: state.scanned.len(),
            pending_sections: self.pending_sections(),
        }
    }

    /// Asks the running job to stop at its next batch boundary. Returns
    /// false if no job is running.
    pub fn stop(&self) -> bool {
        let stopping = self.jobs.stop();
        if stopping {
            info!("engine: stop requested");
        }
        stopping
    }

    /// Checks every structural invariant. Meant for tests and diagnostics.
    pub fn verify_integrity(&self) -> IdentityResult<()> {
        self.state.read().check().map_err(IdentityError::InvalidState)
    }
}

/// Replaces the partition with freshly computed classes.
///
/// Every entity ends up in a class. Members that land in a cluster they are
/// constrained against are moved out and offered to the other clusters.
/// Verified flags of everyone else are kept.
fn apply_classes(state: &mut EngineState, classes: Vec<Class>, rehome_threshold: f32) -> ClusterReport {
    let clusters: Vec<Cluster> = classes
        .into_iter()
        .map(|c| Cluster {
            id: c.id,
            members: c.members.into_iter().collect(),
        })
        .collect();
    state.partition = Partition::from_parts(clusters, BTreeSet::new());

    let blocked: Vec<EntityId> = state
        .partition
        .clusters()
        .iter()
        .flat_map(|c| {
            c.members
                .iter()
                .filter(|m| state.constraints.forbids(m, &c.id))
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect();
    for m in &blocked {
        state.partition.detach(m);
    }
    state.partition.drop_empty();
    place_all(state, &blocked, &[], rehome_threshold);
    state.partition.sort();

    let before = state.names.len();
    state.prune_names();

    ClusterReport {
        entities: state.entities.len(),
        clusters: state.partition.clusters().len(),
        orphans: state.partition.orphans().len(),
        largest: state.partition.clusters().first().map_or(0, Cluster::len),
        evicted: blocked.len(),
        pruned_names: before - state.names.len(),
    }
}

fn summary(state: &EngineState, entity_id: &str) -> Option<EntitySummary> {
    let e = state.entities.get(entity_id)?;
    Some(EntitySummary {
        id: e.id.clone(),
        source: e.source.clone(),
        verified: e.verified,
        cluster_id: state.partition.cluster_of(entity_id).cloned(),
        region: e.region,
        confidence: e.confidence,
        thumbnail: e.thumbnail.clone(),
    })
}

fn cluster_view(state: &EngineState, c: &Cluster, pos: usize, name_prefix: &str) -> ClusterView {
    let custom = state.names.get(&c.id);
    ClusterView {
        id: c.id.clone(),
        name: custom
            .cloned()
            .unwrap_or_else(|| format!("{name_prefix} {}", pos + 1)),
        custom_name: custom.is_some(),
        size: c.len(),
        verified: c.len() - state.unverified_count(c),
        members: c.members.iter().filter_map(|m| summary(state, m)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(deg: f32) -> Vec<f32> {
        let r = deg.to_radians();
        vec![r.cos(), r.sin()]
    }

    fn engine_with(points: &[(&str, f32)]) -> Engine {
        let engine = Engine::in_memory(Config::default()).unwrap();
        let entities = points
            .iter()
            .map(|(id, deg)| Entity::new(*id, format!("{id}.jpg"), at(*deg)))
            .collect();
        engine.add_entities(entities).unwrap();
        engine
    }

    #[test]
    fn add_entities_is_all_or_nothing() {
        let engine = engine_with(&[("a", 0.0)]);
        let err = engine
            .add_entities(vec![
                Entity::new("b", "b.jpg", at(10.0)),
                Entity::new("c", "c.jpg", vec![1.0, 0.0, 0.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, IdentityError::DimensionMismatch { expected: 2, got: 3 }));

        let err = engine
            .add_entities(vec![Entity::new("a", "a.jpg", at(0.0))])
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidArgument(_)));
        assert_eq!(engine.status().total_entities, 1);
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn new_entities_are_placed_online() {
        let engine = engine_with(&[("a", 0.0), ("b", 5.0)]);
        engine.cluster(0.65).unwrap();
        let added = engine
            .add_entities(vec![
                Entity::new("c", "c.jpg", at(3.0)),
                Entity::new("d", "d.jpg", at(120.0)),
            ])
            .unwrap();
        assert_eq!(added.value.placed, 1);
        assert_eq!(added.value.orphaned, 1);
        assert_eq!(engine.get_entity("c").unwrap().cluster_id.as_deref(), Some("cluster_a"));
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn cluster_evicts_constrained_members() {
        let engine = engine_with(&[("a", 0.0), ("b", 5.0), ("c", 60.0)]);
        engine.cluster(0.65).unwrap();
        engine.verify("b", "cluster_a", false).unwrap();
        assert!(engine.constraints("b").contains("cluster_a"));

        // A fresh pass would put b back with a; the constraint keeps it out.
        let report = engine.cluster(0.65).unwrap().value;
        assert_eq!(report.evicted, 1);
        assert_ne!(
            engine.get_entity("b").unwrap().cluster_id.as_deref(),
            Some("cluster_a")
        );
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn names_survive_unchanged_ids_and_are_pruned_otherwise() {
        let engine = engine_with(&[("a", 0.0), ("b", 5.0), ("c", 90.0)]);
        engine.cluster(0.65).unwrap();
        engine.rename("cluster_a", "Alice").unwrap();
        engine.rename("cluster_c", "Carol").unwrap();

        engine.delete_entity("c").unwrap();
        let report = engine.cluster(0.65).unwrap().value;
        assert_eq!(report.pruned_names, 0);
        let clusters = engine.get_clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "Alice");
        assert!(clusters[0].custom_name);
    }

    #[test]
    fn default_names_follow_position() {
        let engine = engine_with(&[("a", 0.0), ("b", 5.0), ("c", 90.0)]);
        engine.cluster(0.65).unwrap();
        let names: Vec<String> = engine.get_clusters().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Person 1", "Person 2"]);
    }

    #[test]
    fn search_and_duplicates() {
        let engine = engine_with(&[("a", 0.0), ("b", 1.0), ("c", 90.0)]);
        let hits = engine.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entity_id, "a");
        assert_eq!(hits[1].entity_id, "b");
        assert!(engine.search(&[1.0, 0.0, 0.0], 2).is_err());
        assert!(engine.search(&[1.0, 0.0], 0).is_err());

        let dups = engine.find_duplicates(0.99).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].canonical, "a");
        assert_eq!(dups[0].members.len(), 2);
    }

    #[test]
    fn thresholds_out_of_range_are_rejected() {
        let engine = engine_with(&[("a", 0.0)]);
        assert!(matches!(
            engine.cluster(1.5).unwrap_err(),
            IdentityError::InvalidArgument(_)
        ));
        assert!(matches!(
            engine.recluster(f32::NAN).unwrap_err(),
            IdentityError::InvalidArgument(_)
        ));
        assert!(!engine.status().job.running);
    }

    #[test]
    fn delete_entity_removes_empty_cluster() {
        let engine = engine_with(&[("a", 0.0), ("c", 90.0)]);
        engine.cluster(0.65).unwrap();
        engine.rename("cluster_c", "Carol").unwrap();
        engine.delete_entity("c").unwrap();
        assert!(engine.get_cluster("cluster_c").is_err());
        assert!(engine.delete_entity("c").is_err());
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn clear_all_empties_everything() {
        let engine = engine_with(&[("a", 0.0), ("b", 5.0)]);
        engine.cluster(0.65).unwrap();
        engine.verify("a", "cluster_a", false).unwrap();
        let cleared = engine.clear_all().unwrap();
        assert!(cleared.is_durable());
        let status = engine.status();
        assert_eq!(status.total_entities, 0);
        assert_eq!(status.total_clusters, 0);
        assert_eq!(status.constraint_pairs, 0);
    }
}
