//! Size-bounding for the directory cache
//!
//! Once the published entries exceed the high water mark, the least recently
//! accessed entries are removed until the total is at or below the low water
//! mark. Last access is the mtime of each entry's marker file, refreshed on
//! every hit. Staged writes in `.tmp` are never counted or touched.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{DirectoryCache, MARKER_FILE, TMP_DIR, entry_size};
use crate::error::{CacheError, Result};

/// Cleaning thresholds in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanPolicy {
    /// Cleaning starts above this total (0 = unbounded)
    pub high_water_mark: u64,
    /// Cleaning stops at or below this total
    pub low_water_mark: u64,
}

impl CleanPolicy {
    pub fn new(high_water_mark: u64, low_water_mark: u64) -> Result<Self> {
        if high_water_mark > 0 && low_water_mark > high_water_mark {
            return Err(CacheError::Config(format!(
                "low water mark {low_water_mark} exceeds high water mark {high_water_mark}"
            )));
        }
        Ok(Self {
            high_water_mark,
            low_water_mark,
        })
    }

    /// Never clean
    pub fn unbounded() -> Self {
        Self {
            high_water_mark: 0,
            low_water_mark: 0,
        }
    }
}

/// Result of a cleaning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Number of entries scanned
    pub scanned: usize,
    pub total_before: u64,
    pub total_after: u64,
    /// Number of entries deleted
    pub deleted: usize,
    pub bytes_freed: u64,
    /// Staged writes skipped
    pub in_progress: usize,
    /// Errors encountered (non-fatal)
    pub errors: Vec<String>,
}

/// Published entry info for cleaning decisions.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub size: u64,
    pub last_access: SystemTime,
}

/// Directory cache cleaner.
pub struct Cleaner {
    cache: DirectoryCache,
    policy: CleanPolicy,
}

impl Cleaner {
    pub fn new(cache: DirectoryCache, policy: CleanPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> CleanPolicy {
        self.policy
    }

    /// Collect every published entry, never entering the staging area
    pub fn scan(&self) -> Vec<EntryInfo> {
        let root = self.cache.root();
        let mut entries = Vec::new();

        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == TMP_DIR));

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable path: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            let marker = entry.path().join(MARKER_FILE);
            let Ok(meta) = std::fs::metadata(&marker) else {
                continue;
            };

            entries.push(EntryInfo {
                path: entry.path().to_path_buf(),
                size: entry_size(entry.path()),
                last_access: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
            // Entries never nest
            walker.skip_current_dir();
        }

        entries
    }

    /// Run one cleaning pass.
    pub fn run(&self) -> CleanReport {
        let mut report = CleanReport {
            in_progress: self.count_in_progress(),
            ..CleanReport::default()
        };

        let mut entries = self.scan();
        report.scanned = entries.len();
        report.total_before = entries.iter().map(|e| e.size).sum();
        report.total_after = report.total_before;

        if self.policy.high_water_mark == 0 || report.total_before <= self.policy.high_water_mark {
            debug!(
                "Directory cache at {} bytes, under high water mark {}",
                report.total_before, self.policy.high_water_mark
            );
            return report;
        }

        // Oldest access first
        entries.sort_by_key(|e| e.last_access);

        for entry in entries {
            if report.total_after <= self.policy.low_water_mark {
                break;
            }
            match self.cache.retire(&entry.path, "evicted") {
                Ok(true) => {
                    debug!("Evicted {:?} ({} bytes)", entry.path, entry.size);
                    report.deleted += 1;
                    report.bytes_freed += entry.size;
                    report.total_after = report.total_after.saturating_sub(entry.size);
                }
                // Already gone
                Ok(false) => {
                    report.total_after = report.total_after.saturating_sub(entry.size);
                }
                Err(e) => {
                    warn!("Failed to evict {:?}: {}", entry.path, e);
                    report
                        .errors
                        .push(format!("{}: {}", entry.path.display(), e));
                }
            }
        }

        info!(
            "Cleaned directory cache: {} entries, {} bytes freed, {} -> {} bytes",
            report.deleted, report.bytes_freed, report.total_before, report.total_after
        );
        report
    }

    fn count_in_progress(&self) -> usize {
        std::fs::read_dir(self.cache.tmp_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
