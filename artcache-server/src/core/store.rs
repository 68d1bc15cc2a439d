use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, ContentHash, HashedArtifact};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::disk::{DiskContent, Loaded};
use super::error::{Result, ServerError};
use super::types::{Counters, StoreConfig, StoreStats};

/// Reads of a key replaced mid-fetch before reporting a miss
const FETCH_ATTEMPTS: usize = 3;

/// Artifact store shared by the HTTP and RPC transports.
///
/// The index lock only guards map updates. Content is written, read and
/// hashed outside of it, and a record becomes visible only once its content
/// is fully published, so readers observe either a complete version or a miss.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    disk: Option<DiskContent>,
    index: RwLock<Index>,
    counters: Mutex<Counters>,
}

/// Stored content reference
#[derive(Clone)]
enum Content {
    Memory(Arc<[ArtifactFile]>),
    Disk(PathBuf),
}

#[derive(Clone)]
struct Record {
    hash: ContentHash,
    size: u64,
    /// LRU position, unique per record
    tick: u64,
    last_access: DateTime<Utc>,
    content: Content,
}

#[derive(Default)]
struct Index {
    /// artifact -> os_arch -> record
    records: HashMap<String, HashMap<String, Record>>,
    /// tick -> key, oldest first
    lru: BTreeMap<u64, ArtifactKey>,
    total_bytes: u64,
    next_tick: u64,
}

impl Index {
    fn get(&self, key: &ArtifactKey) -> Option<&Record> {
        self.records.get(key.artifact())?.get(key.os_arch())
    }

    fn get_mut(&mut self, key: &ArtifactKey) -> Option<&mut Record> {
        self.records.get_mut(key.artifact())?.get_mut(key.os_arch())
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn insert(&mut self, key: ArtifactKey, mut record: Record) -> Option<Record> {
        record.tick = self.tick();
        let replaced = self.remove(&key);
        self.total_bytes += record.size;
        self.lru.insert(record.tick, key.clone());
        self.records
            .entry(key.artifact().to_string())
            .or_default()
            .insert(key.os_arch().to_string(), record);
        replaced
    }

    fn remove(&mut self, key: &ArtifactKey) -> Option<Record> {
        let variants = self.records.get_mut(key.artifact())?;
        let record = variants.remove(key.os_arch())?;
        if variants.is_empty() {
            self.records.remove(key.artifact());
        }
        self.lru.remove(&record.tick);
        self.total_bytes = self.total_bytes.saturating_sub(record.size);
        Some(record)
    }

    fn touch(&mut self, key: &ArtifactKey, tick: u64) {
        let new_tick = self.tick();
        let Some(record) = self.get_mut(key) else {
            return;
        };
        if record.tick != tick {
            return;
        }
        record.tick = new_tick;
        record.last_access = Utc::now();
        self.lru.remove(&tick);
        self.lru.insert(new_tick, key.clone());
    }

    /// Remove least-recently-used records until total is at or below `target`
    fn evict_until(
        &mut self,
        target: u64,
        protect: Option<&ArtifactKey>,
    ) -> Vec<(ArtifactKey, Record)> {
        let mut evicted = Vec::new();
        while self.total_bytes > target {
            let Some(victim) = self
                .lru
                .values()
                .find(|k| Some(*k) != protect)
                .cloned()
            else {
                break;
            };
            if let Some(record) = self.remove(&victim) {
                evicted.push((victim, record));
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }
}

impl ArtifactStore {
    /// Create a store with the given configuration.
    ///
    /// A disk-backed store re-indexes existing content in last-modified
    /// order so eviction keeps working across restarts.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.low_water_mark > config.high_water_mark {
            return Err(ServerError::InvalidRequest(format!(
                "low water mark {} exceeds high water mark {}",
                config.low_water_mark, config.high_water_mark
            )));
        }

        info!(
            "Initializing artifact store: directory={:?}, high_water={}B, low_water={}B",
            config.directory, config.high_water_mark, config.low_water_mark
        );

        let disk = match &config.directory {
            Some(dir) => Some(DiskContent::open(dir)?),
            None => None,
        };

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                disk,
                index: RwLock::new(Index::default()),
                counters: Mutex::new(Counters::default()),
            }),
        };
        store.recover();
        Ok(store)
    }

    /// In-memory store, mostly for tests
    pub fn in_memory(high_water_mark: u64, low_water_mark: u64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: StoreConfig::in_memory(high_water_mark, low_water_mark),
                disk: None,
                index: RwLock::new(Index::default()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn recover(&self) {
        let Some(disk) = &self.inner.disk else {
            return;
        };

        let mut entries = disk.recover();
        entries.sort_by_key(|e| e.modified);

        let mut superseded = Vec::new();
        {
            let mut index = self.inner.index.write();
            for entry in entries {
                let modified: DateTime<Utc> = entry.modified.into();
                let record = Record {
                    hash: entry.hash,
                    size: entry.size,
                    tick: 0,
                    last_access: modified,
                    content: Content::Disk(entry.path),
                };
                if let Some(old) = index.insert(entry.key, record) {
                    superseded.push(old);
                }
            }
        }
        for record in superseded {
            self.discard(&record);
        }

        let evicted = self.enforce_limits(None);
        if evicted > 0 {
            info!("Evicted {} artifacts after recovery", evicted);
        }
    }

    /// Store an artifact after verifying its declared hash
    pub fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()> {
        debug!("STORE key={}, hash={}", key, artifact.hash);

        let actual = artifact.artifact.content_hash();
        if actual != artifact.hash {
            self.inner.counters.lock().rejected += 1;
            warn!(
                "Rejected {}: declared hash {} but content hashes to {}",
                key, artifact.hash, actual
            );
            return Err(ServerError::HashMismatch {
                key: key.to_string(),
                expected: artifact.hash,
                actual,
            });
        }

        let payload = artifact.artifact.total_size();
        let limit = self
            .inner
            .config
            .max_artifact_bytes
            .min(self.inner.config.high_water_mark);
        if payload > limit {
            self.inner.counters.lock().rejected += 1;
            return Err(ServerError::TooLarge {
                size: payload,
                limit,
            });
        }

        let (content, size) = match &self.inner.disk {
            Some(disk) => {
                let (path, size) = disk.write(key, artifact)?;
                (Content::Disk(path), size)
            }
            None => (
                Content::Memory(artifact.artifact.files().to_vec().into()),
                payload,
            ),
        };

        let record = Record {
            hash: artifact.hash,
            size,
            tick: 0,
            last_access: Utc::now(),
            content,
        };

        let replaced = self.inner.index.write().insert(key.clone(), record);
        if let Some(old) = replaced {
            debug!("Replaced previous version of {}", key);
            self.discard(&old);
        }
        self.inner.counters.lock().stores += 1;

        self.enforce_limits(Some(key));
        Ok(())
    }

    /// Fetch an artifact, verifying content against its recorded hash.
    ///
    /// Corrupt content is removed and reported as a miss.
    pub fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>> {
        debug!("FETCH key={}", key);

        let mut attempt = 0;
        let (record, loaded) = loop {
            attempt += 1;
            let snapshot = self.inner.index.read().get(key).cloned();
            let Some(record) = snapshot else {
                let mut counters = self.inner.counters.lock();
                counters.fetches += 1;
                counters.misses += 1;
                return Ok(None);
            };

            let loaded = match &record.content {
                Content::Memory(files) => Some(files.to_vec()),
                Content::Disk(path) => {
                    let disk = self.disk()?;
                    match disk.read(path)? {
                        Loaded::Found(content) if content.hash == record.hash => {
                            Some(content.files)
                        }
                        Loaded::Found(content) => {
                            self.drop_corrupt(
                                key,
                                &record,
                                &format!("header hash {}", content.hash),
                            );
                            None
                        }
                        Loaded::Corrupt(reason) => {
                            self.drop_corrupt(key, &record, &reason);
                            None
                        }
                        Loaded::Missing if attempt < FETCH_ATTEMPTS && self.replaced(key, path) => {
                            debug!("{} replaced while reading, retrying", key);
                            continue;
                        }
                        Loaded::Missing => {
                            // Replaced or evicted between snapshot and read
                            self.drop_if_current(key, record.tick);
                            None
                        }
                    }
                }
            };
            break (record, loaded);
        };

        let verified = loaded.and_then(|files| {
            match Artifact::new(files).and_then(|a| HashedArtifact::verified(record.hash, a)) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    self.drop_corrupt(key, &record, &e.to_string());
                    None
                }
            }
        });

        if verified.is_some() {
            // No-op when a newer version was published while reading; the
            // content we hold is still complete and verified.
            self.inner.index.write().touch(key, record.tick);
        }

        let mut counters = self.inner.counters.lock();
        counters.fetches += 1;
        if verified.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        Ok(verified)
    }

    /// Remove every os_arch variant of one artifact
    pub fn delete_artifact(&self, artifact: &str) -> Result<usize> {
        debug!("DELETE artifact={}", artifact);

        let removed: Vec<Record> = {
            let mut index = self.inner.index.write();
            let keys: Vec<ArtifactKey> = index
                .records
                .get(artifact)
                .map(|variants| {
                    variants
                        .keys()
                        .filter_map(|os_arch| ArtifactKey::new(os_arch.as_str(), artifact).ok())
                        .collect()
                })
                .unwrap_or_default();
            keys.iter().filter_map(|k| index.remove(k)).collect()
        };

        for record in &removed {
            self.discard(record);
        }
        self.inner.counters.lock().deletes += removed.len() as u64;
        Ok(removed.len())
    }

    /// Remove everything
    pub fn delete_all(&self) -> Result<usize> {
        let count = {
            let mut index = self.inner.index.write();
            let count = index.len();
            *index = Index {
                next_tick: index.next_tick,
                ..Index::default()
            };
            count
        };

        if let Some(disk) = &self.inner.disk {
            disk.clear()?;
        }

        info!("Deleted all {} artifacts", count);
        self.inner.counters.lock().deletes += count as u64;
        Ok(count)
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        let index = self.inner.index.read();
        let oldest_access = index
            .lru
            .values()
            .next()
            .and_then(|k| index.get(k))
            .map(|r| r.last_access);
        let counters = self.inner.counters.lock().clone();

        StoreStats {
            artifacts: index.len(),
            total_bytes: index.total_bytes,
            high_water_mark: self.inner.config.high_water_mark,
            low_water_mark: self.inner.config.low_water_mark,
            fetches: counters.fetches,
            hits: counters.hits,
            misses: counters.misses,
            stores: counters.stores,
            rejected: counters.rejected,
            corrupt: counters.corrupt,
            evictions: counters.evictions,
            deletes: counters.deletes,
            oldest_access,
        }
    }

    /// Check if a key is currently indexed
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.inner.index.read().get(key).is_some()
    }

    /// Evict down to the low water mark once above the high water mark
    fn enforce_limits(&self, protect: Option<&ArtifactKey>) -> usize {
        let config = &self.inner.config;
        let evicted = {
            let mut index = self.inner.index.write();
            if index.total_bytes <= config.high_water_mark {
                return 0;
            }
            index.evict_until(config.low_water_mark, protect)
        };

        for (key, record) in &evicted {
            debug!("EVICT key={}, size={}", key, record.size);
            self.discard(record);
        }
        if !evicted.is_empty() {
            info!(
                "Evicted {} artifacts ({} bytes)",
                evicted.len(),
                evicted.iter().map(|(_, r)| r.size).sum::<u64>()
            );
        }
        self.inner.counters.lock().evictions += evicted.len() as u64;
        evicted.len()
    }

    fn drop_corrupt(&self, key: &ArtifactKey, record: &Record, reason: &str) {
        warn!("Corrupt artifact {} removed: {}", key, reason);
        self.inner.counters.lock().corrupt += 1;
        self.drop_if_current(key, record.tick);
    }

    /// Whether the index now points `key` at content other than `path`
    fn replaced(&self, key: &ArtifactKey, path: &Path) -> bool {
        match self.inner.index.read().get(key) {
            Some(Record {
                content: Content::Disk(current),
                ..
            }) => current != path,
            _ => false,
        }
    }

    fn drop_if_current(&self, key: &ArtifactKey, tick: u64) {
        let removed = {
            let mut index = self.inner.index.write();
            match index.get(key) {
                Some(current) if current.tick == tick => index.remove(key),
                _ => None,
            }
        };
        if let Some(record) = removed {
            self.discard(&record);
        }
    }

    fn discard(&self, record: &Record) {
        if let (Content::Disk(path), Some(disk)) = (&record.content, &self.inner.disk) {
            disk.remove(path);
        }
    }

    fn disk(&self) -> Result<&DiskContent> {
        self.inner
            .disk
            .as_ref()
            .ok_or_else(|| ServerError::Internal("disk record in memory store".to_string()))
    }
}
