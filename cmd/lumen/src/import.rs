//! Precomputed embeddings read from a manifest file.
//!
//! The engine does not run models. An external extractor writes a manifest
//! (YAML or JSON) listing each source with its detections, and `lumen import`
//! feeds it through the scan pipeline:
//!
//! ```yaml
//! sources:
//!   - source: 2024/beach.jpg
//!     detections:
//!       - embedding: [0.12, -0.03, ...]
//!         region: { x: 40, y: 32, w: 96, h: 96 }
//!         confidence: 0.98
//!   - source: 2024/empty.jpg
//!     detections: []
//!   - source: 2024/corrupt.jpg
//!     error: truncated JPEG
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use lumen_identity::{Detection, EmbedError, Embedder};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Manifest {
    sources: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    source: String,
    #[serde(default)]
    detections: Vec<Detection>,
    /// Set when the extractor could not read the source.
    #[serde(default)]
    error: Option<String>,
}

/// Serves detections recorded in a manifest.
pub struct ManifestEmbedder {
    sources: Vec<String>,
    entries: HashMap<String, Result<Vec<Detection>, String>>,
}

impl ManifestEmbedder {
    /// Reads a manifest. Files ending in `.json` are parsed as JSON, anything
    /// else as YAML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let manifest: Manifest = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(Self::from_manifest(manifest))
    }

    fn from_manifest(manifest: Manifest) -> Self {
        let mut sources = Vec::with_capacity(manifest.sources.len());
        let mut entries = HashMap::with_capacity(manifest.sources.len());
        for entry in manifest.sources {
            let result = match entry.error {
                Some(message) => Err(message),
                None => Ok(entry.detections),
            };
            if entries.insert(entry.source.clone(), result).is_none() {
                sources.push(entry.source);
            }
        }
        Self { sources, entries }
    }

    /// Sources in manifest order, without repeats.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl Embedder for ManifestEmbedder {
    fn extract(&self, source: &str) -> Result<Vec<Detection>, EmbedError> {
        match self.entries.get(source) {
            Some(Ok(detections)) => Ok(detections.clone()),
            Some(Err(message)) => Err(EmbedError::Unreadable {
                source_ref: source.to_string(),
                message: message.clone(),
            }),
            None => Err(EmbedError::Unreadable {
                source_ref: source.to_string(),
                message: "not in manifest".to_string(),
            }),
        }
    }
}
