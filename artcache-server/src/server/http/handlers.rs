use artcache_protocol::archive::{self, TAR_CONTENT_TYPE};
use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, ContentHash, HASH_HEADER, HashedArtifact};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::core::{CacheService, ServerError, StoreStats};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn CacheService>,
}

#[derive(Debug, Serialize)]
pub struct StoreResponse {
    pub key: String,
    pub hash: ContentHash,
    pub files: usize,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub removed: usize,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "artcache",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.service.stats())
}

/// GET /artifact/{os_arch}/{artifact}
pub async fn artifact_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ServerError> {
    let key = ArtifactKey::from_path(&path)?;
    debug!("REST GET key={}", key);

    let Some(artifact) = state.service.fetch(key.clone()).await? else {
        return Err(ServerError::NotFound(key.to_string()));
    };

    let body = archive::to_tar(&artifact.artifact)
        .map_err(|e| ServerError::Internal(format!("failed to encode {key}: {e}")))?;
    let hash = HeaderValue::from_str(&artifact.hash.to_hex())
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(TAR_CONTENT_TYPE)),
            (HeaderName::from_static(HASH_HEADER), hash),
        ],
        body,
    )
        .into_response())
}

/// POST /artifact/{os_arch}/{artifact}
///
/// Accepts `multipart/form-data` with one part per file (the part filename is
/// the relative path) or a single `application/x-tar` body.
pub async fn artifact_store(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request,
) -> Result<Json<StoreResponse>, ServerError> {
    let key = ArtifactKey::from_path(&path)?;
    let hash = declared_hash(req.headers())?;
    debug!("REST POST key={}, hash={}", key, hash);

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let artifact = if content_type.starts_with("multipart/form-data") {
        read_multipart(req).await?
    } else if content_type.is_empty() || content_type.starts_with(TAR_CONTENT_TYPE) {
        let body = Bytes::from_request(req, &()).await.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ServerError::BodyTooLarge(e.body_text())
            } else {
                ServerError::InvalidRequest(e.body_text())
            }
        })?;
        archive::from_tar(&body)?
    } else {
        return Err(ServerError::InvalidRequest(format!(
            "unsupported content type: {content_type}"
        )));
    };

    let response = StoreResponse {
        key: key.to_string(),
        hash,
        files: artifact.len(),
        size: artifact.total_size(),
    };
    state
        .service
        .store(key, HashedArtifact { hash, artifact })
        .await?;

    Ok(Json(response))
}

/// DELETE /artifact/{artifact}, removing every os_arch variant
pub async fn artifact_delete(
    State(state): State<AppState>,
    Path(artifact): Path<String>,
) -> Result<Json<DeleteResponse>, ServerError> {
    artcache_protocol::validate_artifact(&artifact)?;
    debug!("REST DELETE artifact={}", artifact);

    let removed = state.service.delete_artifact(artifact).await?;
    Ok(Json(DeleteResponse { removed }))
}

/// DELETE /
pub async fn delete_all(State(state): State<AppState>) -> Result<Json<DeleteResponse>, ServerError> {
    debug!("REST DELETE ALL");
    let removed = state.service.delete_all().await?;
    Ok(Json(DeleteResponse { removed }))
}

fn declared_hash(headers: &HeaderMap) -> Result<ContentHash, ServerError> {
    let value = headers
        .get(HASH_HEADER)
        .ok_or_else(|| ServerError::InvalidRequest(format!("missing {HASH_HEADER} header")))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ServerError::InvalidRequest(format!("invalid {HASH_HEADER} header")))
}

async fn read_multipart(req: Request) -> Result<Artifact, ServerError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| ServerError::InvalidRequest(e.body_text()))?;

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let path = field
            .file_name()
            .or_else(|| field.name())
            .map(str::to_string)
            .ok_or_else(|| ServerError::InvalidRequest("multipart part without filename".into()))?;
        let data = field.bytes().await.map_err(multipart_error)?;
        files.push(ArtifactFile::new(path, data));
    }

    Ok(Artifact::new(files)?)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ServerError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::BodyTooLarge(err.body_text())
    } else {
        ServerError::InvalidRequest(err.body_text())
    }
}
