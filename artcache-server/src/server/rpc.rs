//! Binary RPC transport
//!
//! One task per connection. Each connection carries a sequence of
//! request/response frame pairs; a malformed frame is answered with an
//! error response and the connection is closed.

use artcache_protocol::frame::{read_frame, write_frame};
use artcache_protocol::{
    Artifact, FrameError, HashedArtifact, RpcErrorKind, RpcOp, RpcRequest, RpcResponse, RpcResult,
    validate_artifact,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{CacheService, ServerError};

/// RPC server settings
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub max_frame_bytes: u64,
    pub idle_timeout: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: artcache_protocol::frame::DEFAULT_MAX_FRAME_BYTES,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pub struct RpcServer {
    service: Arc<dyn CacheService>,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn new(service: Arc<dyn CacheService>, config: RpcServerConfig) -> Self {
        Self { service, config }
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Open connections finish the request in progress and are then closed.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> std::io::Result<()> {
        info!("RPC server listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New RPC connection from {}", addr);
                        tokio::spawn(handle_connection(
                            Arc::clone(&self.service),
                            self.config.clone(),
                            stream,
                            addr,
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept RPC connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    service: Arc<dyn CacheService>,
    config: RpcServerConfig,
    mut stream: TcpStream,
    addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(
                config.idle_timeout,
                read_frame::<_, RpcRequest>(&mut stream, config.max_frame_bytes),
            ) => next,
            _ = stop.changed() => break,
        };

        let request = match next {
            Err(_) => {
                debug!("Closing idle RPC connection from {}", addr);
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(request))) => request,
            Ok(Err(e)) => {
                warn!("Malformed RPC frame from {}: {}", addr, e);
                let kind = match e {
                    FrameError::TooLarge { .. } => RpcErrorKind::TooLarge,
                    _ => RpcErrorKind::InvalidRequest,
                };
                let response = RpcResponse::error(String::new(), kind, e.to_string());
                let _ = write_frame(&mut stream, &response, config.max_frame_bytes).await;
                break;
            }
        };

        let request_id = request.request_id.clone();
        let response = dispatch(service.as_ref(), request).await;

        match write_frame(&mut stream, &response, config.max_frame_bytes).await {
            Ok(()) => {}
            Err(FrameError::TooLarge { len, max }) => {
                warn!("Response {} of {} bytes exceeds frame limit", request_id, len);
                let response = RpcResponse::error(
                    request_id,
                    RpcErrorKind::TooLarge,
                    format!("response of {len} bytes exceeds frame limit of {max} bytes"),
                );
                if write_frame(&mut stream, &response, config.max_frame_bytes)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!("RPC connection from {} closed: {}", addr, e);
                break;
            }
        }
    }
}

/// Execute one request against the cache service
pub async fn dispatch(service: &dyn CacheService, request: RpcRequest) -> RpcResponse {
    let request_id = request.request_id;
    debug!("RPC request_id={}", request_id);

    let result: Result<RpcResult, ServerError> = match request.op {
        RpcOp::Fetch { key } => match service.fetch(key).await {
            Ok(Some(artifact)) => return RpcResponse::hit(request_id, artifact),
            Ok(None) => Ok(RpcResult::Miss),
            Err(e) => Err(e),
        },
        RpcOp::Store { key, hash, files } => match Artifact::new(files) {
            Ok(artifact) => service
                .store(key, HashedArtifact { hash, artifact })
                .await
                .map(|()| RpcResult::Stored),
            Err(e) => Err(e.into()),
        },
        RpcOp::Delete { artifact } => match validate_artifact(&artifact) {
            Ok(()) => service
                .delete_artifact(artifact)
                .await
                .map(|removed| RpcResult::Deleted {
                    removed: removed as u64,
                }),
            Err(e) => Err(e.into()),
        },
        RpcOp::DeleteAll => service
            .delete_all()
            .await
            .map(|removed| RpcResult::Deleted {
                removed: removed as u64,
            }),
    };

    match result {
        Ok(result) => RpcResponse::new(request_id, result),
        Err(e) => RpcResponse::error(request_id, e.rpc_kind(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactStore;
    use artcache_protocol::{ArtifactFile, ArtifactKey};

    fn service() -> Arc<dyn CacheService> {
        Arc::new(ArtifactStore::in_memory(1 << 20, 1 << 19))
    }

    fn sample() -> HashedArtifact {
        HashedArtifact::seal(
            Artifact::new(vec![ArtifactFile::new("bin/tool", b"\x7fELF".to_vec())]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_store_fetch_delete() {
        let service = service();
        let key = ArtifactKey::new("linux_amd64", "tools/cc/1234").unwrap();
        let artifact = sample();

        let stored = dispatch(service.as_ref(), RpcRequest::store(key.clone(), &artifact)).await;
        assert!(matches!(stored.result, RpcResult::Stored));

        let request = RpcRequest::fetch(key.clone());
        let id = request.request_id.clone();
        let hit = dispatch(service.as_ref(), request).await;
        assert_eq!(hit.request_id, id);
        match hit.result {
            RpcResult::Hit { hash, files } => {
                assert_eq!(hash, artifact.hash);
                assert_eq!(files, artifact.artifact.files());
            }
            other => panic!("expected hit, got {other:?}"),
        }

        let deleted = dispatch(service.as_ref(), RpcRequest::delete("tools/cc/1234")).await;
        assert!(matches!(deleted.result, RpcResult::Deleted { removed: 1 }));

        let miss = dispatch(service.as_ref(), RpcRequest::fetch(key)).await;
        assert!(matches!(miss.result, RpcResult::Miss));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_hash_mismatch() {
        let service = service();
        let key = ArtifactKey::new("linux_amd64", "tools/cc/1234").unwrap();
        let mut artifact = sample();
        artifact.hash = artcache_protocol::ContentHash::digest(b"other");

        let response = dispatch(service.as_ref(), RpcRequest::store(key, &artifact)).await;
        match response.result {
            RpcResult::Error { kind, .. } => assert_eq!(kind, RpcErrorKind::HashMismatch),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_delete() {
        let response = dispatch(service().as_ref(), RpcRequest::delete("../etc")).await;
        match response.result {
            RpcResult::Error { kind, .. } => assert_eq!(kind, RpcErrorKind::InvalidRequest),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
