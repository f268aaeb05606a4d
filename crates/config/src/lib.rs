//! Storage-group configuration: the tunables that govern partitioning,
//! flush thresholds, merge strategy, and the metadata cache.
//!
//! Loaded from a TOML file (or built with [`StorageGroupConfig::default`]
//! and overridden programmatically) the same way the rest of this workspace
//! leans on `serde`/`toml` for persisted structured data.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating a [`StorageGroupConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which file-merge strategy the merge engine uses when combining
/// overlapping seq/unseq files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Rewrite every merge candidate into one fresh file, published back
    /// over the primary sequence file's own path and `FileResource` identity
    /// rather than a newly allocated one. Same full-rewrite I/O cost as
    /// `Squeeze`; the distinction is identity preservation, not savings.
    Inplace,
    /// Rewrite every merge candidate into one fresh file at a newly
    /// allocated path, decommissioning every input including any primary
    /// sequence file.
    Squeeze,
    /// Select merge candidates by total estimated output size rather than
    /// file count.
    IndependenceSize,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::Inplace
    }
}

/// Tunables for one storage group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageGroupConfig {
    /// Width of one time partition, in milliseconds.
    pub partition_interval_ms: i64,
    /// Byte size at which an active memtable is swapped to flushing.
    pub memtable_size_threshold: usize,
    /// Maximum unsequence files allowed to accumulate per partition before a
    /// merge is triggered automatically.
    pub unseq_files_per_partition_max: usize,
    /// Byte budget for the metadata cache (see `metacache::CacheConfig`).
    pub metadata_cache_size: usize,
    /// Which merge strategy the merge engine uses.
    pub merge_strategy: MergeStrategy,
    /// Byte budget a merge task may use for in-memory chunk buffers.
    pub merge_memory_budget: usize,
    /// TTL floor: files whose every device's end time is before this bound
    /// relative to "now" are excluded from merge candidacy.
    pub time_lower_bound_ms: i64,
    /// During recovery, treat every pending merge as a full merge.
    pub force_full_merge: bool,
    /// Maximum children per metadata-index tree node.
    pub max_degree_of_index_node: usize,
    /// False-positive rate for the per-file bloom filter over
    /// `device.measurement` keys.
    pub bloom_filter_error_rate: f64,
}

impl Default for StorageGroupConfig {
    fn default() -> Self {
        Self {
            partition_interval_ms: 7 * 24 * 60 * 60 * 1000,
            memtable_size_threshold: 64 * 1024 * 1024,
            unseq_files_per_partition_max: 100,
            metadata_cache_size: 32 * 1024 * 1024,
            merge_strategy: MergeStrategy::Inplace,
            merge_memory_budget: 256 * 1024 * 1024,
            time_lower_bound_ms: 0,
            force_full_merge: false,
            max_degree_of_index_node: 256,
            bloom_filter_error_rate: 0.01,
        }
    }
}

impl StorageGroupConfig {
    /// Loads a config from a TOML file. Missing fields fall back to
    /// [`StorageGroupConfig::default`] values (`#[serde(default)]`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Rejects settings that would make the engine misbehave rather than
    /// just run slowly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_interval_ms <= 0 {
            return Err(ConfigError::Invalid("partition_interval_ms must be positive".into()));
        }
        if self.memtable_size_threshold == 0 {
            return Err(ConfigError::Invalid("memtable_size_threshold must be positive".into()));
        }
        if self.max_degree_of_index_node < 2 {
            return Err(ConfigError::Invalid("max_degree_of_index_node must be >= 2".into()));
        }
        if !(0.0..1.0).contains(&self.bloom_filter_error_rate) {
            return Err(ConfigError::Invalid("bloom_filter_error_rate must be in (0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
