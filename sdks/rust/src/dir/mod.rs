//! Local directory cache
//!
//! Layout under the cache root:
//!
//! ```text
//! {root}/{os_arch}/{artifact}/            artifact files, verbatim
//! {root}/{os_arch}/{artifact}/.artcache-entry   marker (JSON)
//! {root}/.tmp/                            staging and removal area
//! ```
//!
//! An entry becomes visible only when its fully written staging directory is
//! renamed into place, and it disappears by being renamed back into `.tmp`,
//! so a reader sees a complete entry or nothing.

pub mod cleaner;

pub use cleaner::{CleanPolicy, CleanReport, Cleaner};

use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, ContentHash, HashedArtifact};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};

/// Marker file published with every entry
pub const MARKER_FILE: &str = ".artcache-entry";
/// Staging area below the cache root
pub const TMP_DIR: &str = ".tmp";

/// Staging leftovers older than this are removed when the cache is opened
const ABANDONED_AFTER: Duration = Duration::from_secs(60 * 60);

/// Contents of the marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMarker {
    pub hash: ContentHash,
    pub os_arch: String,
    pub artifact: String,
    /// Total bytes of the artifact files
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Directory-backed cache rooted at one path
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))?;

        let cache = Self { root };
        cache.purge_abandoned();
        info!("Opened directory cache at {:?}", cache.root);
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Directory holding the entry for `key`
    pub fn entry_dir(&self, key: &ArtifactKey) -> PathBuf {
        let mut dir = self.root.join(key.os_arch());
        for segment in key.artifact().split('/') {
            dir.push(segment);
        }
        dir
    }

    /// Verify and atomically publish an artifact
    pub fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()> {
        artifact.verify()?;
        let dest = self.entry_dir(key);
        self.check_no_nesting(key, &dest)?;

        let stage = self.staging_path("partial");
        if let Err(e) = self.write_stage(&stage, key, artifact) {
            remove_tree(&stage);
            return Err(e.into());
        }

        if let Err(e) = self.publish(&stage, &dest) {
            remove_tree(&stage);
            return Err(e.into());
        }

        debug!("Stored {} in {:?}", key, self.root);
        Ok(())
    }

    /// Fetch and verify an entry.
    ///
    /// A missing entry is `None`. An entry whose files no longer match its
    /// marker is removed and also reported as `None`.
    pub fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>> {
        let dir = self.entry_dir(key);
        let marker_path = dir.join(MARKER_FILE);

        let raw_marker = match fs::read(&marker_path) {
            Ok(bytes) => bytes,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotADirectory => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let marker: EntryMarker = match serde_json::from_slice(&raw_marker) {
            Ok(marker) => marker,
            Err(e) => {
                self.discard_corrupt(key, &dir, &format!("unreadable marker: {e}"));
                return Ok(None);
            }
        };
        if marker.os_arch != key.os_arch() || marker.artifact != key.artifact() {
            self.discard_corrupt(key, &dir, "marker names another key");
            return Ok(None);
        }

        let files = match read_entry_files(&dir) {
            Ok(files) => files,
            // Replaced or removed while reading
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let verified = Artifact::new(files)
            .and_then(|artifact| HashedArtifact::verified(marker.hash, artifact));
        match verified {
            Ok(artifact) => {
                // Last access for the cleaner
                if let Err(e) = filetime::set_file_mtime(&marker_path, FileTime::now()) {
                    debug!("Failed to touch {:?}: {}", marker_path, e);
                }
                Ok(Some(artifact))
            }
            Err(e) => {
                // The entry may have been replaced while its files were read
                if fs::read(&marker_path).is_ok_and(|current| current == raw_marker) {
                    self.discard_corrupt(key, &dir, &e.to_string());
                }
                Ok(None)
            }
        }
    }

    /// Remove one entry; removing a missing entry succeeds
    pub fn delete(&self, key: &ArtifactKey) -> Result<bool> {
        let dir = self.entry_dir(key);
        if !dir.join(MARKER_FILE).exists() {
            return Ok(false);
        }
        let removed = self.retire(&dir, "deleted")?;
        if removed {
            self.prune_empty_parents(&dir);
        }
        Ok(removed)
    }

    /// Remove every os_arch variant of an artifact
    pub fn delete_artifact(&self, artifact: &str) -> Result<usize> {
        artcache_protocol::validate_artifact(artifact)?;

        let mut removed = 0;
        for os_arch in self.os_arch_dirs()? {
            let Ok(key) = ArtifactKey::new(os_arch, artifact) else {
                continue;
            };
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every entry. The staging area is left alone so in-flight
    /// stores still complete.
    pub fn delete_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == TMP_DIR {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                self.retire(&path, "deleted")?;
            } else if let Err(e) = fs::remove_file(&path) {
                if !is_not_found(&e) {
                    return Err(e.into());
                }
            }
        }
        info!("Cleared directory cache at {:?}", self.root);
        Ok(())
    }

    /// Build a cleaner for this cache
    pub fn cleaner(&self, policy: CleanPolicy) -> Cleaner {
        Cleaner::new(self.clone(), policy)
    }

    fn write_stage(&self, stage: &Path, key: &ArtifactKey, artifact: &HashedArtifact) -> io::Result<()> {
        fs::create_dir_all(stage)?;

        for file in artifact.artifact.files() {
            let path = stage.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_synced(&path, &file.data)?;
        }

        let marker = EntryMarker {
            hash: artifact.hash,
            os_arch: key.os_arch().to_string(),
            artifact: key.artifact().to_string(),
            size: artifact.artifact.total_size(),
            stored_at: Utc::now(),
        };
        let encoded = serde_json::to_vec_pretty(&marker).map_err(io::Error::other)?;
        write_synced(&stage.join(MARKER_FILE), &encoded)?;
        fsync_dir(stage).ok();
        Ok(())
    }

    fn publish(&self, stage: &Path, dest: &Path) -> io::Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| io::Error::other("entry has no parent directory"))?;
        fs::create_dir_all(parent)?;

        let stale = if dest.exists() {
            let stale = self.staging_path("stale");
            match fs::rename(dest, &stale) {
                Ok(()) => Some(stale),
                Err(e) if is_not_found(&e) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let mut renamed = fs::rename(stage, dest);
        if matches!(&renamed, Err(e) if is_not_found(e)) {
            // A concurrent delete pruned the parent after it was created
            debug!("Parent of {:?} vanished, retrying publish", dest);
            renamed = fs::create_dir_all(parent).and_then(|()| fs::rename(stage, dest));
        }

        let published = match renamed {
            Ok(()) => {
                fsync_dir(parent).ok();
                Ok(())
            }
            // A concurrent store of the same key published first; its
            // content is equally valid for this key.
            Err(_) if dest.join(MARKER_FILE).exists() => {
                debug!("Concurrent store already published {:?}", dest);
                remove_tree(stage);
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Some(stale) = stale {
            remove_tree(&stale);
        }
        published
    }

    /// Reject keys that would nest inside, or contain, another entry
    fn check_no_nesting(&self, key: &ArtifactKey, dest: &Path) -> Result<()> {
        let base = self.root.join(key.os_arch());
        let mut ancestor = dest.parent();
        while let Some(dir) = ancestor {
            if !dir.starts_with(&base) {
                break;
            }
            if dir.join(MARKER_FILE).exists() {
                return Err(CacheError::InvalidArtifact(format!(
                    "{key} would nest inside the entry at {}",
                    dir.display()
                )));
            }
            ancestor = dir.parent();
        }

        if dest.is_dir() && !dest.join(MARKER_FILE).exists() {
            let contains_entry = WalkDir::new(dest)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().is_file() && e.file_name() == MARKER_FILE);
            if contains_entry {
                return Err(CacheError::InvalidArtifact(format!(
                    "{key} would contain other entries"
                )));
            }
        }
        Ok(())
    }

    /// Move a directory into the staging area, then delete it
    pub(crate) fn retire(&self, dir: &Path, reason: &str) -> Result<bool> {
        let target = self.staging_path(reason);
        match fs::rename(dir, &target) {
            Ok(()) => {
                remove_tree(&target);
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn discard_corrupt(&self, key: &ArtifactKey, dir: &Path, reason: &str) {
        warn!("Corrupt cache entry {} removed: {}", key, reason);
        if let Err(e) = self.retire(dir, "corrupt") {
            warn!("Failed to remove corrupt entry {:?}: {}", dir, e);
        }
    }

    fn staging_path(&self, suffix: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}", uuid::Uuid::new_v4().simple(), suffix))
    }

    fn os_arch_dirs(&self) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == TMP_DIR || !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                dirs.push(name.to_string());
            }
        }
        Ok(dirs)
    }

    fn prune_empty_parents(&self, dir: &Path) {
        let mut current = dir.parent();
        while let Some(parent) = current {
            if parent == self.root || !parent.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(parent).is_err() {
                break;
            }
            current = parent.parent();
        }
    }

    fn purge_abandoned(&self) {
        let Ok(entries) = fs::read_dir(self.tmp_dir()) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > ABANDONED_AFTER) {
                debug!("Removing abandoned staging entry {:?}", entry.path());
                remove_tree(&entry.path());
            }
        }
    }
}

/// Read every artifact file of an entry directory, skipping the marker
fn read_entry_files(dir: &Path) -> io::Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop in cache entry"))
        })?;
        if entry.depth() == 1 && entry.file_name() == MARKER_FILE {
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let data = fs::read(entry.path())?;
        files.push(ArtifactFile::new(rel, Bytes::from(data)));
    }
    Ok(files)
}

/// Sum of file sizes below `dir`, excluding the marker
pub(crate) fn entry_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !(e.depth() == 1 && e.file_name() == MARKER_FILE))
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn remove_tree(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = removed {
        if !is_not_found(&e) {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}
