//! Storage engine configuration.
//!
//! All knobs are plain serde-backed values so an embedding server can load
//! them from its own configuration file format.

use serde::{Deserialize, Serialize};

/// Tunables for the storage engine. One instance is shared by every
/// repository created through a manager.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Computation cache specification, e.g.
    /// `"maximumWeight=134217728,expireAfterAccess=300s"`.
    pub cache_spec: String,
    /// Number of blocking worker threads per repository.
    pub num_repository_workers: usize,
    /// Hard cap applied to the `max_commits` argument of `history`.
    pub max_num_commits_per_history: usize,
    /// Compaction: minimum number of commits to retain. 0 disables.
    pub min_retention_commits: usize,
    /// Compaction: minimum age in days of discarded history. 0 disables the
    /// age gate.
    pub min_retention_days: u32,
    /// Per-operation deadline in milliseconds. 0 disables the deadline.
    pub request_timeout_millis: u64,
}

impl StoreConfig {
    /// Default cache specification: 128 MiB, 5 minute idle expiry.
    pub const DEFAULT_CACHE_SPEC: &'static str =
        "maximumWeight=134217728,expireAfterAccess=300s";
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_spec: Self::DEFAULT_CACHE_SPEC.to_string(),
            num_repository_workers: num_cpus::get().clamp(2, 16),
            max_num_commits_per_history: 1000,
            min_retention_commits: 0,
            min_retention_days: 0,
            request_timeout_millis: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let cfg = StoreConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache_spec, cfg.cache_spec);
        assert_eq!(back.max_num_commits_per_history, 1000);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{"minRetentionCommits": 7}"#).unwrap();
        assert_eq!(cfg.min_retention_commits, 7);
        assert_eq!(cfg.request_timeout_millis, 10_000);
    }
}
