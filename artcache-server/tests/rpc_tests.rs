// RPC Transport Tests
// Framed request/response exchanges over raw TCP connections

use artcache_protocol::frame::{encode_frame, read_frame, write_frame};
use artcache_protocol::{
    Artifact, ArtifactFile, ArtifactKey, HashedArtifact, RpcErrorKind, RpcRequest, RpcResponse,
    RpcResult,
};
use artcache_server::{ArtifactStore, CacheService, RpcServer, RpcServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const MAX_FRAME: u64 = 1 << 20;

async fn spawn_rpc_server(config: RpcServerConfig) -> SocketAddr {
    let service: Arc<dyn CacheService> = Arc::new(ArtifactStore::in_memory(1 << 20, 1 << 19));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        RpcServer::new(service, config)
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });

    addr
}

fn config() -> RpcServerConfig {
    RpcServerConfig {
        max_frame_bytes: MAX_FRAME,
        idle_timeout: Duration::from_secs(30),
    }
}

async fn call(stream: &mut TcpStream, request: &RpcRequest) -> RpcResponse {
    write_frame(stream, request, MAX_FRAME).await.unwrap();
    read_frame(stream, MAX_FRAME).await.unwrap().unwrap()
}

fn sample() -> HashedArtifact {
    HashedArtifact::seal(
        Artifact::new(vec![
            ArtifactFile::new("obj/main.o", b"\x7fELF main".to_vec()),
            ArtifactFile::new("obj/util.o", b"\x7fELF util".to_vec()),
        ])
        .unwrap(),
    )
}

#[tokio::test]
async fn test_rpc_store_fetch_on_one_connection() {
    let addr = spawn_rpc_server(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key = ArtifactKey::new("linux_amd64", "app/main/ff00").unwrap();
    let artifact = sample();

    let request = RpcRequest::store(key.clone(), &artifact);
    let response = call(&mut stream, &request).await;
    assert_eq!(response.request_id, request.request_id);
    assert!(matches!(response.result, RpcResult::Stored));

    let request = RpcRequest::fetch(key);
    let response = call(&mut stream, &request).await;
    assert_eq!(response.request_id, request.request_id);
    match response.result {
        RpcResult::Hit { hash, files } => {
            assert_eq!(hash, artifact.hash);
            assert_eq!(files, artifact.artifact.files());
        }
        other => panic!("expected hit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rpc_miss_and_delete_all() {
    let addr = spawn_rpc_server(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key = ArtifactKey::new("linux_amd64", "app/main/ff00").unwrap();

    let response = call(&mut stream, &RpcRequest::fetch(key.clone())).await;
    assert!(matches!(response.result, RpcResult::Miss));

    call(&mut stream, &RpcRequest::store(key.clone(), &sample())).await;
    let response = call(&mut stream, &RpcRequest::delete_all()).await;
    assert!(matches!(response.result, RpcResult::Deleted { removed: 1 }));

    let response = call(&mut stream, &RpcRequest::fetch(key)).await;
    assert!(matches!(response.result, RpcResult::Miss));
}

#[tokio::test]
async fn test_rpc_hash_mismatch_keeps_connection_open() {
    let addr = spawn_rpc_server(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let key = ArtifactKey::new("linux_amd64", "app/main/ff00").unwrap();
    let mut artifact = sample();
    artifact.hash = artcache_protocol::ContentHash::digest(b"forged");

    let response = call(&mut stream, &RpcRequest::store(key.clone(), &artifact)).await;
    match response.result {
        RpcResult::Error { kind, .. } => assert_eq!(kind, RpcErrorKind::HashMismatch),
        other => panic!("expected error, got {other:?}"),
    }

    let response = call(&mut stream, &RpcRequest::fetch(key)).await;
    assert!(matches!(response.result, RpcResult::Miss));
}

#[tokio::test]
async fn test_rpc_corrupt_frame_gets_error_and_close() {
    let addr = spawn_rpc_server(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut frame = encode_frame(&RpcRequest::delete_all(), MAX_FRAME).unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    stream.write_all(&frame).await.unwrap();

    let response: RpcResponse = read_frame(&mut stream, MAX_FRAME).await.unwrap().unwrap();
    match response.result {
        RpcResult::Error { kind, .. } => assert_eq!(kind, RpcErrorKind::InvalidRequest),
        other => panic!("expected error, got {other:?}"),
    }

    let next: Option<RpcResponse> = read_frame(&mut stream, MAX_FRAME).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_rpc_oversized_frame_rejected() {
    let addr = spawn_rpc_server(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Length prefix announcing a body above the limit
    stream
        .write_all(&((MAX_FRAME as u32) + 1).to_be_bytes())
        .await
        .unwrap();

    let response: RpcResponse = read_frame(&mut stream, MAX_FRAME).await.unwrap().unwrap();
    match response.result {
        RpcResult::Error { kind, .. } => assert_eq!(kind, RpcErrorKind::TooLarge),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rpc_idle_connection_closed() {
    let addr = spawn_rpc_server(RpcServerConfig {
        max_frame_bytes: MAX_FRAME,
        idle_timeout: Duration::from_millis(100),
    })
    .await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let next: Option<RpcResponse> = read_frame(&mut stream, MAX_FRAME).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_rpc_concurrent_connections() {
    let addr = spawn_rpc_server(config()).await;
    let artifact = sample();

    let mut handles = Vec::new();
    for i in 0..8 {
        let artifact = artifact.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let key = ArtifactKey::new("linux_amd64", format!("app/part{i}/00")).unwrap();
            let response = call(&mut stream, &RpcRequest::store(key.clone(), &artifact)).await;
            assert!(matches!(response.result, RpcResult::Stored));
            let response = call(&mut stream, &RpcRequest::fetch(key)).await;
            assert!(matches!(response.result, RpcResult::Hit { .. }));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}
