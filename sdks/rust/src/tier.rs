//! Cache tier abstraction

use artcache_protocol::{ArtifactKey, HashedArtifact};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::TierKind;
use crate::dir::{CleanPolicy, CleanReport, DirectoryCache};
use crate::error::{CacheError, Result};

/// One cache backend.
///
/// Implementations verify content hashes on both store and fetch; a fetch
/// never returns content that does not match its hash.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Human-readable location, used in logs
    fn describe(&self) -> String;

    async fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>>;

    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()>;

    /// Remove every os_arch variant of `key.artifact()`
    async fn delete(&self, key: &ArtifactKey) -> Result<()>;

    async fn delete_all(&self) -> Result<()>;
}

/// [`DirectoryCache`] as a tier, running filesystem work on blocking threads
#[derive(Clone)]
pub struct DirectoryTier {
    cache: Arc<DirectoryCache>,
}

impl DirectoryTier {
    pub fn new(cache: DirectoryCache) -> Self {
        Self {
            cache: Arc::new(cache),
        }
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    /// Run one cleaning pass on a blocking thread
    pub async fn clean(&self, policy: CleanPolicy) -> Result<CleanReport> {
        let cache = Arc::clone(&self.cache);
        blocking(move || Ok(cache.cleaner(policy).run())).await
    }
}

#[async_trait]
impl CacheTier for DirectoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Directory
    }

    fn describe(&self) -> String {
        self.cache.root().display().to_string()
    }

    async fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        blocking(move || cache.fetch(&key)).await
    }

    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        let artifact = artifact.clone();
        blocking(move || cache.store(&key, &artifact)).await
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        blocking(move || cache.delete_artifact(key.artifact()).map(|_| ())).await
    }

    async fn delete_all(&self) -> Result<()> {
        let cache = Arc::clone(&self.cache);
        blocking(move || cache.delete_all()).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        CacheError::Storage(std::io::Error::other(format!("directory task failed: {e}")))
    })?
}
