use artcache_protocol::{ArtifactKey, HashedArtifact};
use async_trait::async_trait;

use super::error::{Result, ServerError};
use super::store::ArtifactStore;
use super::types::StoreStats;

/// Storage operations shared by the HTTP and RPC transports
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn fetch(&self, key: ArtifactKey) -> Result<Option<HashedArtifact>>;

    async fn store(&self, key: ArtifactKey, artifact: HashedArtifact) -> Result<()>;

    /// Remove every os_arch variant of an artifact, returning the number removed
    async fn delete_artifact(&self, artifact: String) -> Result<usize>;

    async fn delete_all(&self) -> Result<usize>;

    fn stats(&self) -> StoreStats;
}

#[async_trait]
impl CacheService for ArtifactStore {
    async fn fetch(&self, key: ArtifactKey) -> Result<Option<HashedArtifact>> {
        let store = self.clone();
        blocking(move || store.fetch(&key)).await
    }

    async fn store(&self, key: ArtifactKey, artifact: HashedArtifact) -> Result<()> {
        let store = self.clone();
        blocking(move || store.store(&key, &artifact)).await
    }

    async fn delete_artifact(&self, artifact: String) -> Result<usize> {
        let store = self.clone();
        blocking(move || store.delete_artifact(&artifact)).await
    }

    async fn delete_all(&self) -> Result<usize> {
        let store = self.clone();
        blocking(move || store.delete_all()).await
    }

    fn stats(&self) -> StoreStats {
        ArtifactStore::stats(self)
    }
}

/// Run filesystem and hashing work off the async executor
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(format!("storage task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use artcache_protocol::{Artifact, ArtifactFile};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_service_over_store() {
        let service: Arc<dyn CacheService> = Arc::new(ArtifactStore::in_memory(1024, 512));
        let key = ArtifactKey::new("linux_amd64", "pkg/a/1").unwrap();
        let artifact = HashedArtifact::seal(
            Artifact::new(vec![ArtifactFile::new("a.o", b"obj".to_vec())]).unwrap(),
        );

        service.store(key.clone(), artifact.clone()).await.unwrap();
        let fetched = service.fetch(key.clone()).await.unwrap().unwrap();
        assert_eq!(fetched, artifact);

        assert_eq!(service.delete_artifact("pkg/a/1".into()).await.unwrap(), 1);
        assert!(service.fetch(key).await.unwrap().is_none());
        assert_eq!(service.stats().deletes, 1);
    }
}
