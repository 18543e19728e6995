//! Ingest collaborators: turning sources (image paths) into entities.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::Region;

/// One thing found in a source: a detected face, or the whole image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl Detection {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            region: None,
            confidence: None,
            thumbnail: None,
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }
}

/// Why an embedder could not process a source.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embed: unreadable source {source_ref}: {message}")]
    Unreadable { source_ref: String, message: String },

    #[error("embed: model error: {0}")]
    Model(String),
}

/// Produces embeddings for a source.
///
/// A source with nothing detectable returns an empty list, not an error.
pub trait Embedder: Send + Sync {
    fn extract(&self, source: &str) -> Result<Vec<Detection>, EmbedError>;
}

/// Options for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Skip sources that were scanned before. A non-incremental scan starts
    /// from an empty state.
    pub incremental: bool,
    /// Process at most this many sources. 0 means no limit.
    pub limit: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            incremental: true,
            limit: 0,
        }
    }
}

/// What a scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Sources handed to the embedder.
    pub sources_scanned: usize,
    /// Sources skipped because they were scanned before.
    pub sources_skipped: usize,
    /// Sources the embedder failed on.
    pub sources_failed: usize,
    pub entities_added: usize,
    /// New entities placed into an existing cluster as they arrived.
    pub placed_online: usize,
    /// True if the scan was stopped before it finished. Committed batches
    /// are kept.
    pub cancelled: bool,
    /// Clusters after the closing clustering pass. Absent if the scan was
    /// cancelled.
    pub clusters: Option<usize>,
}
