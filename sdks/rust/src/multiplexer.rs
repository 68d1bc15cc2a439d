//! Multi-tier cache front end
//!
//! Reads walk the tiers in precedence order and stop at the first verified
//! hit. Writes fan out to every tier concurrently. A tier that fails or
//! times out is logged and treated as absent; apart from invalid input the
//! cache never returns an error to the build.

use artcache_protocol::{ArtifactKey, HashedArtifact};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, TierKind};
use crate::dir::{CleanPolicy, CleanReport, DirectoryCache};
use crate::error::{CacheError, Result};
use crate::http::HttpTier;
use crate::rpc::RpcTier;
use crate::tier::{CacheTier, DirectoryTier};

/// Outcome of a store across tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Tiers that accepted the artifact
    pub stored: Vec<TierKind>,
    /// Tiers that failed, with the reason
    pub failed: Vec<(TierKind, String)>,
}

impl StoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cache interface used by the build orchestrator
#[async_trait]
pub trait BuildCache: Send + Sync {
    /// Look up an artifact; every failure is a miss
    async fn get(&self, key: &ArtifactKey) -> Option<HashedArtifact>;

    /// Store an artifact in every tier.
    ///
    /// Fails only when the artifact does not match its hash.
    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<StoreReport>;

    /// Remove every os_arch variant of an artifact from every tier
    async fn delete(&self, key: &ArtifactKey);

    async fn delete_all(&self);
}

/// Open the cache described by `config`.
///
/// A disabled configuration yields a cache that always misses. A directory
/// tier that cannot be opened is skipped with a warning.
pub fn open(config: &CacheConfig) -> Result<Arc<dyn BuildCache>> {
    if config.disabled {
        info!("Build cache disabled");
        return Ok(Arc::new(DisabledCache));
    }
    config.validate()?;

    let multiplexer = Multiplexer::from_config(config)?;
    if config.directory.clean_on_start {
        multiplexer.start_cleaner();
    }
    Ok(Arc::new(multiplexer))
}

/// Cache over an ordered list of tiers
pub struct Multiplexer {
    tiers: Vec<Arc<dyn CacheTier>>,
    directories: Vec<DirectoryTier>,
    timeout: Duration,
    clean_policy: CleanPolicy,
    in_flight: Arc<Mutex<HashMap<ArtifactKey, usize>>>,
}

impl Multiplexer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            directories: Vec::new(),
            timeout,
            clean_policy: CleanPolicy::unbounded(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build tiers in configured precedence
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let mut multiplexer = Self::new(config.request_timeout());
        multiplexer.clean_policy = CleanPolicy::new(
            config.directory.high_water_mark,
            config.directory.low_water_mark,
        )?;

        for kind in config.tier_order() {
            match kind {
                TierKind::Directory => match DirectoryCache::open(&config.directory.path) {
                    Ok(cache) => multiplexer = multiplexer.with_directory(cache),
                    Err(e) => warn!(
                        "Directory cache at {:?} unavailable, continuing without it: {}",
                        config.directory.path, e
                    ),
                },
                TierKind::Http => {
                    let tier = HttpTier::new(&config.http.url, config.request_timeout())?;
                    multiplexer = multiplexer.with_tier(Arc::new(tier));
                }
                TierKind::Rpc => {
                    let tier = RpcTier::new(
                        config.rpc.address.clone(),
                        config.request_timeout(),
                        config.rpc.max_idle_connections,
                    );
                    multiplexer = multiplexer.with_tier(Arc::new(tier));
                }
            }
        }

        info!(
            "Build cache tiers: [{}]",
            multiplexer
                .tiers
                .iter()
                .map(|t| format!("{} {}", t.kind(), t.describe()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(multiplexer)
    }

    /// Append a directory tier
    pub fn with_directory(mut self, cache: DirectoryCache) -> Self {
        let tier = DirectoryTier::new(cache);
        self.directories.push(tier.clone());
        self.tiers.push(Arc::new(tier));
        self
    }

    /// Append a remote tier
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Set the policy used by [`Multiplexer::start_cleaner`]
    pub fn with_clean_policy(mut self, policy: CleanPolicy) -> Self {
        self.clean_policy = policy;
        self
    }

    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind()).collect()
    }

    /// Clean every directory tier once in the background.
    ///
    /// Without a Tokio runtime the pass runs on the calling thread.
    pub fn start_cleaner(&self) -> Option<JoinHandle<Vec<CleanReport>>> {
        let directories = self.directories.clone();
        let policy = self.clean_policy;
        if directories.is_empty() || policy.high_water_mark == 0 {
            return None;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                let mut reports = Vec::new();
                for tier in directories {
                    match tier.clean(policy).await {
                        Ok(report) => reports.push(report),
                        Err(e) => warn!("Cleaning {} failed: {}", tier.describe(), e),
                    }
                }
                reports
            })),
            Err(_) => {
                for tier in &directories {
                    tier.cache().cleaner(policy).run();
                }
                None
            }
        }
    }

    /// Run a tier call, bounding remote tiers by the request timeout
    async fn bounded<T>(
        &self,
        kind: TierKind,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if !kind.is_remote() {
            return call.await;
        }
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(kind)),
        }
    }

    async fn backfill(&self, key: &ArtifactKey, artifact: &HashedArtifact) {
        if self.in_flight.lock().contains_key(key) {
            debug!("Skipping back-fill of {}: store in flight", key);
            return;
        }
        for tier in &self.directories {
            match tier.store(key, artifact).await {
                Ok(()) => debug!("Back-filled {} into {}", key, tier.describe()),
                Err(e) => warn!("Back-fill of {} into {} failed: {}", key, tier.describe(), e),
            }
        }
    }
}

#[async_trait]
impl BuildCache for Multiplexer {
    async fn get(&self, key: &ArtifactKey) -> Option<HashedArtifact> {
        for tier in &self.tiers {
            let kind = tier.kind();
            match self.bounded(kind, tier.fetch(key)).await {
                Ok(Some(artifact)) => {
                    debug!("Cache hit for {} in {} tier", key, kind);
                    if kind.is_remote() {
                        self.backfill(key, &artifact).await;
                    }
                    return Some(artifact);
                }
                Ok(None) => debug!("Cache miss for {} in {} tier", key, kind),
                Err(e) => warn!(
                    "Cache fetch of {} from {} tier {} failed: {}",
                    key,
                    kind,
                    tier.describe(),
                    e
                ),
            }
        }
        None
    }

    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<StoreReport> {
        artifact.verify()?;
        let _guard = InFlight::enter(&self.in_flight, key);

        let results = join_all(self.tiers.iter().map(|tier| {
            let kind = tier.kind();
            async move { (kind, tier.describe(), self.bounded(kind, tier.store(key, artifact)).await) }
        }))
        .await;

        let mut report = StoreReport::default();
        for (kind, location, result) in results {
            match result {
                Ok(()) => report.stored.push(kind),
                Err(e) => {
                    warn!("Cache store of {} to {} tier {} failed: {}", key, kind, location, e);
                    report.failed.push((kind, e.to_string()));
                }
            }
        }
        debug!(
            "Stored {} in {} of {} tiers",
            key,
            report.stored.len(),
            self.tiers.len()
        );
        Ok(report)
    }

    async fn delete(&self, key: &ArtifactKey) {
        let results = join_all(self.tiers.iter().map(|tier| async move {
            (tier.kind(), self.bounded(tier.kind(), tier.delete(key)).await)
        }))
        .await;
        for (kind, result) in results {
            if let Err(e) = result {
                warn!("Cache delete of {} from {} tier failed: {}", key, kind, e);
            }
        }
    }

    async fn delete_all(&self) {
        let results = join_all(self.tiers.iter().map(|tier| async move {
            (tier.kind(), self.bounded(tier.kind(), tier.delete_all()).await)
        }))
        .await;
        for (kind, result) in results {
            if let Err(e) = result {
                warn!("Cache delete-all on {} tier failed: {}", kind, e);
            }
        }
    }
}

/// Marks a key as being stored until dropped
struct InFlight {
    map: Arc<Mutex<HashMap<ArtifactKey, usize>>>,
    key: ArtifactKey,
}

impl InFlight {
    fn enter(map: &Arc<Mutex<HashMap<ArtifactKey, usize>>>, key: &ArtifactKey) -> Self {
        *map.lock().entry(key.clone()).or_insert(0) += 1;
        Self {
            map: Arc::clone(map),
            key: key.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if let Some(count) = map.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Cache used when caching is turned off
pub struct DisabledCache;

#[async_trait]
impl BuildCache for DisabledCache {
    async fn get(&self, _key: &ArtifactKey) -> Option<HashedArtifact> {
        None
    }

    async fn store(&self, _key: &ArtifactKey, _artifact: &HashedArtifact) -> Result<StoreReport> {
        Ok(StoreReport::default())
    }

    async fn delete(&self, _key: &ArtifactKey) {}

    async fn delete_all(&self) {}
}
