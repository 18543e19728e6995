//! Configuration file for the lumen CLI.
//!
//! Stored in ~/.lumen/config.yaml. Every key is optional:
//!
//! ```yaml
//! data_dir: /srv/photos/.lumen
//! storage: redb
//! log: lumen_identity=debug
//! engine:
//!   threshold: 0.7
//!   rehome_threshold: 0.6
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default base directory name under the home directory.
pub const DEFAULT_BASE_DIR: &str = ".lumen";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Database file used by the redb backend, inside the data directory.
pub const REDB_FILE: &str = "lumen.redb";

/// Where engine sections are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// One file per section in the data directory.
    #[default]
    Dir,
    /// A single redb database in the data directory.
    Redb,
}

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Data directory (default: ~/.lumen/data).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    pub storage: Storage,

    /// Log filter in `RUST_LOG` syntax. `RUST_LOG` wins when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    /// Engine settings.
    pub engine: lumen_identity::Config,
}

impl FileConfig {
    /// Gets the default config directory (~/.lumen).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR))
    }

    /// Gets the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|dir| dir.join(DEFAULT_CONFIG_FILE))
    }

    /// Loads the config.
    ///
    /// An explicit `path` must exist. A missing default file yields the
    /// default config.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            if required {
                anyhow::bail!("config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolves the data directory.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_dir()
                .map(|dir| dir.join("data"))
                .context("could not find home directory; pass --data-dir"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = FileConfig::parse(
            "storage: redb\nengine:\n  threshold: 0.7\n  name_prefix: Face\n",
        )
        .unwrap();
        assert_eq!(cfg.storage, Storage::Redb);
        assert_eq!(cfg.engine.threshold, 0.7);
        assert_eq!(cfg.engine.name_prefix, "Face");
        assert_eq!(cfg.engine.rehome_threshold, 0.60);
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn empty_file_is_default() {
        let cfg = FileConfig::parse("\n").unwrap();
        assert_eq!(cfg.storage, Storage::Dir);
        assert_eq!(cfg.engine, lumen_identity::Config::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(FileConfig::load(Some(&missing)).is_err());

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "data_dir: /tmp/lumen\nlog: debug\n").unwrap();
        let cfg = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.data_dir.as_deref(), Some(Path::new("/tmp/lumen")));
        assert_eq!(cfg.log.as_deref(), Some("debug"));
    }
}
