use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};

/// Engine configuration.
///
/// Every field has a default, so a partial YAML or JSON block deserializes
/// into a usable config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding dimension. 0 infers it from the first stored entity.
    pub dim: usize,

    /// Minimum cosine similarity for two entities to be unioned by a
    /// clustering pass. Default: 0.65.
    pub threshold: f32,

    /// Minimum similarity to a verified anchor during re-clustering.
    /// Default: 0.60.
    pub recluster_threshold: f32,

    /// Minimum similarity to a cluster centroid when re-homing a rejected,
    /// evicted or newly scanned entity. Default: 0.60.
    pub rehome_threshold: f32,

    /// Rows compared per block in a clustering pass. Bounds peak work
    /// between progress reports. Default: 500.
    pub block_size: usize,

    /// Sources embedded per committed scan batch. Default: 16.
    pub scan_batch_size: usize,

    /// Prepended to cluster IDs (e.g. "cluster" -> "cluster_3f2a...").
    pub id_prefix: String,

    /// Prefix of default display names (e.g. "Person" -> "Person 1").
    pub name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dim: 0,
            threshold: 0.65,
            recluster_threshold: 0.60,
            rehome_threshold: 0.60,
            block_size: 500,
            scan_batch_size: 16,
            id_prefix: "cluster".to_string(),
            name_prefix: "Person".to_string(),
        }
    }
}

impl Config {
    /// Rejects out-of-range thresholds and zero batch sizes.
    pub fn validate(&self) -> IdentityResult<()> {
        check_threshold(self.threshold)?;
        check_threshold(self.recluster_threshold)?;
        check_threshold(self.rehome_threshold)?;
        if self.block_size == 0 {
            return Err(IdentityError::InvalidArgument(
                "block_size must be positive".into(),
            ));
        }
        if self.scan_batch_size == 0 {
            return Err(IdentityError::InvalidArgument(
                "scan_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Similarity thresholds must lie in `[0, 1]`. Out-of-range values and NaN
/// are rejected, never clamped.
pub fn check_threshold(threshold: f32) -> IdentityResult<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(IdentityError::InvalidArgument(format!(
            "threshold {threshold} outside [0, 1]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.threshold, 0.65);
        assert_eq!(cfg.rehome_threshold, 0.60);
        assert_eq!(cfg.block_size, 500);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"threshold": 0.7, "dim": 4}"#).unwrap();
        assert_eq!(cfg.threshold, 0.7);
        assert_eq!(cfg.dim, 4);
        assert_eq!(cfg.id_prefix, "cluster");
    }

    #[test]
    fn thresholds_are_rejected_not_clamped() {
        assert!(check_threshold(0.0).is_ok());
        assert!(check_threshold(1.0).is_ok());
        assert!(check_threshold(1.01).is_err());
        assert!(check_threshold(-0.1).is_err());
        assert!(check_threshold(f32::NAN).is_err());

        let cfg = Config {
            block_size: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
