//! RPC cache tier client
//!
//! Keeps a small pool of idle connections. A connection that saw any error
//! or timeout is dropped rather than returned, since a late response would
//! otherwise be read as the answer to the next request. A pooled connection
//! the server closed while it sat idle is replaced by a fresh one once,
//! within the same timeout.

use artcache_protocol::frame::{DEFAULT_MAX_FRAME_BYTES, read_frame, write_frame};
use artcache_protocol::rpc::hashed_from_wire;
use artcache_protocol::{
    ArtifactKey, FrameError, HashedArtifact, RpcRequest, RpcResponse, RpcResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::TierKind;
use crate::error::{CacheError, Result};
use crate::tier::CacheTier;

/// Client of an artcache RPC server
#[derive(Clone)]
pub struct RpcTier {
    address: String,
    timeout: Duration,
    max_frame_bytes: u64,
    max_idle: usize,
    idle: Arc<Mutex<Vec<TcpStream>>>,
}

impl RpcTier {
    pub fn new(address: impl Into<String>, timeout: Duration, max_idle: usize) -> Self {
        Self {
            address: address.into(),
            timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_idle,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the largest frame accepted from the server
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u64) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of pooled idle connections
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Send one request and wait for its response, bounded by the timeout
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResult> {
        match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(TierKind::Rpc)),
        }
    }

    async fn exchange(&self, request: RpcRequest) -> Result<RpcResult> {
        let pooled = self.idle.lock().pop();
        let reused = match pooled {
            Some(mut stream) => match self.round_trip(&mut stream, &request).await {
                Ok(Some(response)) => Some((stream, response)),
                // Closed by the server while idle; nothing was answered
                Ok(None) | Err(FrameError::Io(_)) => {
                    debug!("Pooled RPC connection to {} went stale, reconnecting", self.address);
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let (stream, response) = match reused {
            Some(exchanged) => exchanged,
            None => {
                let mut stream = self.connect().await?;
                let response = self.round_trip(&mut stream, &request).await?.ok_or_else(|| {
                    CacheError::transport(TierKind::Rpc, "connection closed by server")
                })?;
                (stream, response)
            }
        };

        if response.request_id != request.request_id {
            return Err(CacheError::transport(
                TierKind::Rpc,
                format!(
                    "response for request {} while waiting for {}",
                    response.request_id, request.request_id
                ),
            ));
        }

        {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(stream);
            }
        }

        match response.result {
            RpcResult::Error { kind, message } => Err(CacheError::transport(
                TierKind::Rpc,
                format!("server error ({kind:?}): {message}"),
            )),
            result => Ok(result),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        debug!("Opening RPC connection to {}", self.address);
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            CacheError::transport(
                TierKind::Rpc,
                format!("failed to connect to {}: {e}", self.address),
            )
        })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn round_trip(
        &self,
        stream: &mut TcpStream,
        request: &RpcRequest,
    ) -> std::result::Result<Option<RpcResponse>, FrameError> {
        write_frame(stream, request, self.max_frame_bytes).await?;
        read_frame(stream, self.max_frame_bytes).await
    }
}

fn unexpected(result: &RpcResult) -> CacheError {
    CacheError::transport(TierKind::Rpc, format!("unexpected response: {result:?}"))
}

#[async_trait]
impl CacheTier for RpcTier {
    fn kind(&self) -> TierKind {
        TierKind::Rpc
    }

    fn describe(&self) -> String {
        self.address.clone()
    }

    async fn fetch(&self, key: &ArtifactKey) -> Result<Option<HashedArtifact>> {
        debug!("RPC FETCH {}", key);
        match self.call(RpcRequest::fetch(key.clone())).await? {
            RpcResult::Hit { hash, files } => Ok(Some(hashed_from_wire(hash, files)?)),
            RpcResult::Miss => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    async fn store(&self, key: &ArtifactKey, artifact: &HashedArtifact) -> Result<()> {
        debug!("RPC STORE {}", key);
        match self.call(RpcRequest::store(key.clone(), artifact)).await? {
            RpcResult::Stored => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<()> {
        debug!("RPC DELETE {}", key.artifact());
        match self.call(RpcRequest::delete(key.artifact())).await? {
            RpcResult::Deleted { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_all(&self) -> Result<()> {
        debug!("RPC DELETE ALL");
        match self.call(RpcRequest::delete_all()).await? {
            RpcResult::Deleted { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}
