use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the artifact store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding artifact content; `None` keeps content in memory
    pub directory: Option<PathBuf>,
    /// Eviction starts once total size exceeds this many bytes
    pub high_water_mark: u64,
    /// Eviction stops once total size is at or below this many bytes
    pub low_water_mark: u64,
    /// Largest single artifact accepted
    pub max_artifact_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: None,
            high_water_mark: 10 * 1024 * 1024 * 1024,
            low_water_mark: 8 * 1024 * 1024 * 1024,
            max_artifact_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// In-memory store bounded by the given water marks
    pub fn in_memory(high_water_mark: u64, low_water_mark: u64) -> Self {
        Self {
            directory: None,
            high_water_mark,
            low_water_mark: low_water_mark.min(high_water_mark),
            max_artifact_bytes: high_water_mark,
        }
    }

    /// Disk-backed store rooted at `directory`
    pub fn on_disk(directory: impl Into<PathBuf>, high_water_mark: u64, low_water_mark: u64) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Self::in_memory(high_water_mark, low_water_mark)
        }
    }
}

/// Live statistics of the artifact store
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    /// Number of stored artifact variants
    pub artifacts: usize,
    /// Bytes held by stored content
    pub total_bytes: u64,
    pub high_water_mark: u64,
    pub low_water_mark: u64,
    /// Number of fetch operations
    pub fetches: u64,
    pub hits: u64,
    pub misses: u64,
    /// Number of successful stores
    pub stores: u64,
    /// Stores rejected for hash mismatch or invalid content
    pub rejected: u64,
    /// Entries found corrupt on fetch and removed
    pub corrupt: u64,
    pub evictions: u64,
    /// Entries removed by explicit delete
    pub deletes: u64,
    pub oldest_access: Option<DateTime<Utc>>,
}

impl StoreStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters updated by store operations
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub fetches: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub rejected: u64,
    pub corrupt: u64,
    pub evictions: u64,
    pub deletes: u64,
}
