// Wire compatibility tests
// Requests and responses decoded from frames as a peer would send them

use artcache_protocol::frame::{DEFAULT_MAX_FRAME_BYTES, encode_frame, read_frame};
use artcache_protocol::rpc::hashed_from_wire;
use artcache_protocol::{
    Artifact, ArtifactFile, ArtifactKey, ContentHash, FrameError, HashedArtifact, ProtocolError,
    RpcOp, RpcRequest, RpcResponse, RpcResult, archive,
};
use serde::Serialize;

fn sample() -> HashedArtifact {
    HashedArtifact::seal(
        Artifact::new(vec![
            ArtifactFile::new("bin/app", b"\x7fELF".to_vec()),
            ArtifactFile::new("share/app/config.toml", b"[app]\n".to_vec()),
        ])
        .unwrap(),
    )
}

#[tokio::test]
async fn test_store_request_survives_framing() {
    let key = ArtifactKey::new("darwin_arm64", "app/bin/77aa").unwrap();
    let request = RpcRequest::store(key.clone(), &sample());
    let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).unwrap();

    let mut reader = frame.as_slice();
    let decoded: RpcRequest = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(decoded.request_id, request.request_id);
    match decoded.op {
        RpcOp::Store {
            key: decoded_key,
            hash,
            files,
        } => {
            assert_eq!(decoded_key, key);
            assert_eq!(hashed_from_wire(hash, files).unwrap(), sample());
        }
        other => panic!("unexpected op: {other:?}"),
    }
}

#[tokio::test]
async fn test_several_frames_on_one_stream() {
    let mut stream = Vec::new();
    for result in [RpcResult::Miss, RpcResult::Stored, RpcResult::Deleted { removed: 2 }] {
        let response = RpcResponse::new("r", result);
        stream.extend(encode_frame(&response, DEFAULT_MAX_FRAME_BYTES).unwrap());
    }

    let mut reader = stream.as_slice();
    let mut results = Vec::new();
    while let Some(response) = read_frame::<_, RpcResponse>(&mut reader, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
    {
        results.push(response.result);
    }

    assert_eq!(results.len(), 3);
    assert!(matches!(results[2], RpcResult::Deleted { removed: 2 }));
}

#[derive(Serialize)]
struct PeerKey {
    os_arch: &'static str,
    artifact: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum PeerOp {
    Fetch { key: PeerKey },
}

#[derive(Serialize)]
struct PeerRequest {
    request_id: &'static str,
    op: PeerOp,
}

#[tokio::test]
async fn test_invalid_key_from_peer_fails_to_decode() {
    let request = PeerRequest {
        request_id: "1",
        op: PeerOp::Fetch {
            key: PeerKey {
                os_arch: "linux_amd64",
                artifact: "../../etc/passwd",
            },
        },
    };
    let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).unwrap();

    let mut reader = frame.as_slice();
    let result = read_frame::<_, RpcRequest>(&mut reader, DEFAULT_MAX_FRAME_BYTES).await;
    assert!(matches!(result, Err(FrameError::Decode(_))));
}

#[tokio::test]
async fn test_valid_key_from_peer_decodes() {
    let request = PeerRequest {
        request_id: "2",
        op: PeerOp::Fetch {
            key: PeerKey {
                os_arch: "linux_amd64",
                artifact: "lib/core/00ff",
            },
        },
    };
    let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).unwrap();

    let mut reader = frame.as_slice();
    let decoded: RpcRequest = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
        .unwrap();
    match decoded.op {
        RpcOp::Fetch { key } => assert_eq!(key.to_path(), "linux_amd64/lib/core/00ff"),
        other => panic!("unexpected op: {other:?}"),
    }
}

#[test]
fn test_wire_hit_with_forged_hash_is_rejected() {
    let files = sample().artifact.into_files();
    assert!(matches!(
        hashed_from_wire(ContentHash::digest(b"forged"), files),
        Err(ProtocolError::HashMismatch { .. })
    ));
}

#[test]
fn test_tar_body_hash_matches_multipart_hash() {
    // Both HTTP upload encodings address the same content
    let artifact = sample();
    let tar = archive::to_tar(&artifact.artifact).unwrap();
    let decoded = archive::from_tar(&tar).unwrap();
    assert_eq!(decoded.content_hash(), artifact.hash);
}
