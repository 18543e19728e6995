//! lumen - group photos by face and find duplicates.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lumen_identity::{Applied, DirStore, Engine, RedbStore, ScanOptions, SectionStore};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod config;
mod import;
mod output;

use config::{FileConfig, REDB_FILE, Storage};
use import::ManifestEmbedder;
use output::Output;

/// lumen - group photos by face and find duplicates.
///
/// Embeddings are produced elsewhere and imported from a manifest. lumen
/// clusters them into identities and keeps the grouping consistent while you
/// confirm, reject, merge and name clusters.
///
/// Configuration is read from ~/.lumen/config.yaml.
#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Face identity clustering for photo libraries")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.lumen/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (default is ~/.lumen/data)
    #[arg(short = 'd', long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Storage backend
    #[arg(long, global = true, value_enum)]
    pub storage: Option<Storage>,

    /// Output as JSON (default is YAML)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import detections from a manifest, then cluster
    Import {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
        /// Drop everything and import from scratch
        #[arg(long)]
        full: bool,
        /// Import at most this many new sources
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Cluster every entity from scratch
    Cluster {
        /// Similarity threshold (default from config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Re-cluster around verified entities
    Recluster {
        /// Similarity threshold (default from config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Confirm an entity belongs to a cluster, or reject it
    Verify {
        entity: String,
        cluster: String,
        /// Reject instead of confirm
        #[arg(long)]
        reject: bool,
    },
    /// Move every member of one cluster into another
    Merge { source: String, target: String },
    /// Name a cluster
    Rename { cluster: String, name: String },
    /// List clusters
    Clusters {
        /// Include members
        #[arg(long)]
        members: bool,
    },
    /// Show one cluster with its members
    Show { cluster: String },
    /// Show one entity
    Entity { id: String },
    /// List entities that belong to no cluster
    Orphans,
    /// Find groups of near-identical entities
    Duplicates {
        #[arg(short, long, default_value_t = 0.95)]
        threshold: f32,
    },
    /// Find entities similar to a vector
    Search {
        /// Query embedding, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        vector: Vec<f32>,
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
    },
    /// Show engine status
    Status,
    /// Delete an entity
    Delete { entity: String },
    /// Drop every rejection constraint
    ClearConstraints,
    /// Delete all data
    Clear {
        /// Confirm
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = FileConfig::load(cli.config.as_deref())?;
    init_logging(&cli, &cfg);

    let engine = open_engine(&cli, &cfg)?;
    let out = Output::new(cli.json);
    run(&cli.command, &engine, &out)?;

    if let Err(e) = engine.flush() {
        warn!("some changes are not saved yet: {e}");
    }
    Ok(())
}

fn init_logging(cli: &Cli, cfg: &FileConfig) {
    let fallback = if cli.verbose {
        "debug"
    } else {
        cfg.log.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_engine(cli: &Cli, cfg: &FileConfig) -> Result<Engine> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => cfg.data_dir()?,
    };
    let store: Box<dyn SectionStore> = match cli.storage.unwrap_or(cfg.storage) {
        Storage::Dir => Box::new(DirStore::open(&data_dir)?),
        Storage::Redb => {
            std::fs::create_dir_all(&data_dir)?;
            Box::new(RedbStore::open(data_dir.join(REDB_FILE))?)
        }
    };
    let engine = Engine::open(cfg.engine.clone(), store)?;
    let loaded = engine.load_report();
    if loaded.repaired() {
        warn!("stored data was repaired on load: {loaded:?}");
    }
    Ok(engine)
}

fn run(command: &Commands, engine: &Engine, out: &Output) -> Result<()> {
    let config = engine.config();
    match command {
        Commands::Import {
            manifest,
            full,
            limit,
        } => {
            let embedder = ManifestEmbedder::load(manifest)?;
            let opts = ScanOptions {
                incremental: !full,
                limit: *limit,
            };
            applied(out, engine.scan(embedder.sources(), &embedder, opts)?)
        }
        Commands::Cluster { threshold } => {
            applied(out, engine.cluster(threshold.unwrap_or(config.threshold))?)
        }
        Commands::Recluster { threshold } => applied(
            out,
            engine.recluster(threshold.unwrap_or(config.recluster_threshold))?,
        ),
        Commands::Verify {
            entity,
            cluster,
            reject,
        } => applied(out, engine.verify(entity, cluster, !reject)?),
        Commands::Merge { source, target } => applied(out, engine.merge(source, target)?),
        Commands::Rename { cluster, name } => applied(out, engine.rename(cluster, name)?),
        Commands::Clusters { members } => {
            let mut clusters = engine.get_clusters();
            if !members {
                for c in &mut clusters {
                    c.members.clear();
                }
            }
            out.write(&clusters)
        }
        Commands::Show { cluster } => out.write(&engine.get_cluster(cluster)?),
        Commands::Entity { id } => {
            let entity = engine.get_entity(id)?;
            let constraints = engine.constraints(id);
            out.write(&EntityDetail {
                entity,
                rejected_from: constraints.into_iter().collect(),
            })
        }
        Commands::Orphans => out.write(&engine.get_orphans()),
        Commands::Duplicates { threshold } => out.write(&engine.find_duplicates(*threshold)?),
        Commands::Search { vector, top_k } => out.write(&engine.search(vector, *top_k)?),
        Commands::Status => out.write(&engine.status()),
        Commands::Delete { entity } => applied(out, engine.delete_entity(entity)?),
        Commands::ClearConstraints => applied(out, engine.clear_constraints()?),
        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete all data without --yes");
            }
            applied(out, engine.clear_all()?)
        }
    }
}

#[derive(Serialize)]
struct EntityDetail {
    #[serde(flatten)]
    entity: lumen_identity::EntitySummary,
    rejected_from: Vec<String>,
}

fn applied<T: Serialize>(out: &Output, applied: Applied<T>) -> Result<()> {
    if !applied.is_durable() {
        warn!("not saved yet: {:?}", applied.pending);
    }
    out.write(&applied.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_search_vector() {
        let cli = Cli::parse_from(["lumen", "search", "--vector", "0.5,-0.25,1", "-k", "3"]);
        match cli.command {
            Commands::Search { vector, top_k } => {
                assert_eq!(vector, vec![0.5, -0.25, 1.0]);
                assert_eq!(top_k, 3);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn verify_and_reject() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "lumen",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--storage",
            "redb",
            "verify",
            "e1",
            "cluster_e1",
            "--reject",
        ]);
        assert_eq!(cli.storage, Some(Storage::Redb));
        let cfg = FileConfig::default();
        let engine = open_engine(&cli, &cfg).unwrap();
        // Nothing stored yet: the entity is unknown.
        let err = run(&cli.command, &engine, &Output::new(true)).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(dir.path().join(REDB_FILE).exists());
    }
}
