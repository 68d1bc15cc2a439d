//! HTTP cache tier client

use artcache_protocol::archive;
use artcache_protocol::{ArtifactKey, ContentHash, HASH_HEADER, HashedArtifact};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::TierKind;
use crate::error::{CacheError, Result};
use crate::tier::CacheTier;

/// Client of an artcache HTTP server
#[derive(Clone)]
pub struct HttpTier {
    http_client: Client,
    base_url: Url,
}

impl HttpTier {
    /// Create a client for the server at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn artifact_url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("artifact/{path}"))?)
    }

    fn error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            CacheError::Timeout(TierKind::Http)
        } else {
            CacheError::transport(TierKind::Http, err.to_string())
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response.text().await.unwrap_or_default();
        Err(CacheError::transport(
            TierKind::Http,
            format!("server returned {status}: {error_text}"),
        ))
    }
}

#[async_trait]
impl CacheTier for HttpTier {
    fn kind(&self) -> TierKind {
        TierKind::Http
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }

    async fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>> {
        let url = self.artifact_url(&key.to_path())?;
        debug!("HTTP GET {}", url);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response).await?;

        let hash: ContentHash = response
            .headers()
            .get(HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                CacheError::transport(TierKind::Http, format!("response without {HASH_HEADER}"))
            })?;
        let body = response.bytes().await.map_err(|e| self.error(e))?;

        let artifact = archive::from_tar(&body)?;
        Ok(Some(HashedArtifact::verified(hash, artifact)?))
    }

    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()> {
        let url = self.artifact_url(&key.to_path())?;
        debug!("HTTP POST {} ({} files)", url, artifact.artifact.len());

        // Part filenames carry the relative path verbatim
        let form = artifact
            .artifact
            .files()
            .iter()
            .fold(Form::new().percent_encode_noop(), |form, file| {
                form.part(
                    "file",
                    Part::stream(file.data.clone()).file_name(file.path.clone()),
                )
            });

        let response = self
            .http_client
            .post(url)
            .header(HASH_HEADER, artifact.hash.to_hex())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<()> {
        let url = self.artifact_url(key.artifact())?;
        debug!("HTTP DELETE {}", url);

        let response = self
            .http_client
            .delete(url)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        debug!("HTTP DELETE {}", self.base_url);
        let response = self
            .http_client
            .delete(self.base_url.clone())
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artcache_protocol::archive::TAR_CONTENT_TYPE;
    use artcache_protocol::{Artifact, ArtifactFile};

    /// Tar body for an artifact, as the server sends it
    fn tar_body(artifact: &HashedArtifact) -> (Vec<u8>, &'static str) {
        (archive::to_tar(&artifact.artifact).unwrap(), TAR_CONTENT_TYPE)
    }

    fn sample() -> HashedArtifact {
        HashedArtifact::seal(
            Artifact::new(vec![ArtifactFile::new("lib/a.so", b"\x7fELF".to_vec())]).unwrap(),
        )
    }

    fn key() -> ArtifactKey {
        ArtifactKey::new("linux_amd64", "lib/a/0011").unwrap()
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let tier = HttpTier::new("http://cache.local:15600/ci", Duration::from_secs(1)).unwrap();
        assert_eq!(tier.base_url().as_str(), "http://cache.local:15600/ci/");
        assert_eq!(
            tier.artifact_url("linux_amd64/lib/a/0011").unwrap().as_str(),
            "http://cache.local:15600/ci/artifact/linux_amd64/lib/a/0011"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(HttpTier::new("not-a-valid-url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_miss_on_404() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/artifact/linux_amd64/lib/a/0011")
            .with_status(404)
            .with_body(r#"{"error": "Artifact not found", "code": 404}"#)
            .create_async()
            .await;

        let tier = HttpTier::new(&server.url(), Duration::from_secs(5)).unwrap();
        assert!(tier.fetch(&key()).await.unwrap().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_hit_is_verified() {
        let artifact = sample();
        let (body, content_type) = tar_body(&artifact);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/artifact/linux_amd64/lib/a/0011")
            .with_status(200)
            .with_header("content-type", content_type)
            .with_header(HASH_HEADER, &artifact.hash.to_hex())
            .with_body(body)
            .create_async()
            .await;

        let tier = HttpTier::new(&server.url(), Duration::from_secs(5)).unwrap();
        assert_eq!(tier.fetch(&key()).await.unwrap().unwrap(), artifact);
    }

    #[tokio::test]
    async fn test_fetch_rejects_wrong_hash() {
        let artifact = sample();
        let (body, content_type) = tar_body(&artifact);
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/artifact/linux_amd64/lib/a/0011")
            .with_status(200)
            .with_header("content-type", content_type)
            .with_header(HASH_HEADER, &ContentHash::digest(b"forged").to_hex())
            .with_body(body)
            .create_async()
            .await;

        let tier = HttpTier::new(&server.url(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            tier.fetch(&key()).await,
            Err(CacheError::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_sends_hash_header() {
        let artifact = sample();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/artifact/linux_amd64/lib/a/0011")
            .match_header(HASH_HEADER, artifact.hash.to_hex().as_str())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let tier = HttpTier::new(&server.url(), Duration::from_secs(5)).unwrap();
        tier.store(&key(), &artifact).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/artifact/lib/a/0011")
            .with_status(500)
            .with_body(r#"{"error": "Storage error", "code": 500}"#)
            .create_async()
            .await;

        let tier = HttpTier::new(&server.url(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            tier.delete(&key()).await,
            Err(CacheError::Transport {
                tier: TierKind::Http,
                ..
            })
        ));
    }
}
