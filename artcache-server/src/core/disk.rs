//! Disk-backed artifact content
//!
//! Layout: `{root}/{os_arch}/{artifact}/{hash}.{version}.art`, each file a
//! MessagePack-encoded file list. Every write gets a fresh version name, so a
//! published file is never modified in place. Writes are staged in
//! `{root}/.tmp` and published with a rename.

use artcache_protocol::{ArtifactFile, ArtifactKey, ContentHash, HashedArtifact};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::{Result, ServerError};

pub(crate) const TMP_DIR: &str = ".tmp";
const CONTENT_EXT: &str = "art";

#[derive(Serialize)]
struct ContentRef<'a> {
    hash: &'a ContentHash,
    files: &'a [ArtifactFile],
}

#[derive(Deserialize)]
pub(crate) struct StoredContent {
    pub hash: ContentHash,
    pub files: Vec<ArtifactFile>,
}

/// Outcome of loading a content file
pub(crate) enum Loaded {
    Found(StoredContent),
    Missing,
    Corrupt(String),
}

/// Content file found while re-indexing a directory
#[derive(Debug)]
pub(crate) struct RecoveredEntry {
    pub key: ArtifactKey,
    pub hash: ContentHash,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub(crate) struct DiskContent {
    root: PathBuf,
}

impl DiskContent {
    /// Open the content directory, discarding partial writes from a previous run
    pub fn open(root: &Path) -> Result<Self> {
        let tmp = root.join(TMP_DIR);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)
                .map_err(|e| ServerError::from_io("failed to clear staging directory", e))?;
        }
        fs::create_dir_all(&tmp)
            .map_err(|e| ServerError::from_io("failed to create staging directory", e))?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Write content to a fresh version file, returning its path and size
    pub fn write(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<(PathBuf, u64)> {
        let encoded = rmp_serde::to_vec_named(&ContentRef {
            hash: &artifact.hash,
            files: artifact.artifact.files(),
        })
        .map_err(|e| ServerError::Internal(format!("failed to encode {key}: {e}")))?;

        let version = uuid::Uuid::new_v4().simple().to_string();
        let tmp = self.root.join(TMP_DIR).join(format!("{version}.partial"));
        let dir = self.entry_dir(key);
        let dest = dir.join(format!("{}.{}.{}", artifact.hash, version, CONTENT_EXT));

        let staged = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::create_dir_all(&dir)?;
            fs::rename(&tmp, &dest)?;
            fsync_dir(&dir).ok();
            Ok(())
        })();

        if let Err(e) = staged {
            let _ = fs::remove_file(&tmp);
            return Err(ServerError::from_io(&format!("failed to write {key}"), e));
        }

        debug!("Published {} ({} bytes) at {:?}", key, encoded.len(), dest);
        Ok((dest, encoded.len() as u64))
    }

    pub fn read(&self, path: &Path) -> Result<Loaded> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(ServerError::from_io("failed to read content", e)),
        };

        match rmp_serde::from_slice::<StoredContent>(&bytes) {
            Ok(content) => Ok(Loaded::Found(content)),
            Err(e) => Ok(Loaded::Corrupt(e.to_string())),
        }
    }

    /// Remove a content file and any directories left empty
    pub fn remove(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {:?}: {}", path, e);
                return;
            }
        }
        self.prune_empty_parents(path);
    }

    /// Remove all published content, leaving the staging directory alone
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| ServerError::from_io("failed to list content directory", e))?;
        for entry in entries.flatten() {
            if entry.file_name() == TMP_DIR {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!("Failed to remove {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    /// Scan the directory for published content files
    pub fn recover(&self) -> Vec<RecoveredEntry> {
        let mut recovered = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == TMP_DIR));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable path during recovery: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            match self.parse_content_path(entry.path()) {
                Some((key, hash)) => {
                    let Ok(meta) = entry.metadata() else {
                        continue;
                    };
                    recovered.push(RecoveredEntry {
                        key,
                        hash,
                        path: entry.path().to_path_buf(),
                        size: meta.len(),
                        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    });
                }
                None => warn!("Ignoring unexpected file {:?}", entry.path()),
            }
        }

        info!(
            "Recovered {} content files from {:?}",
            recovered.len(),
            self.root
        );
        recovered
    }

    fn entry_dir(&self, key: &ArtifactKey) -> PathBuf {
        let mut dir = self.root.join(key.os_arch());
        for segment in key.artifact().split('/') {
            dir.push(segment);
        }
        dir
    }

    fn parse_content_path(&self, path: &Path) -> Option<(ArtifactKey, ContentHash)> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut segments: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;

        let file_name = segments.pop()?;
        let (hash, rest) = file_name.split_once('.')?;
        if !rest.ends_with(CONTENT_EXT) {
            return None;
        }
        let hash: ContentHash = hash.parse().ok()?;

        if segments.len() < 2 {
            return None;
        }
        let os_arch = segments.remove(0);
        let key = ArtifactKey::new(os_arch, segments.join("/")).ok()?;
        Some((key, hash))
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
