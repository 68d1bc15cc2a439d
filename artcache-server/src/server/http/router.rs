use super::handlers::{self, AppState};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get},
};
use tower_http::trace::TraceLayer;

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        // Health and statistics
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        // Artifact endpoints; GET/POST take `{os_arch}/{artifact}`, DELETE takes `{artifact}`
        .route(
            "/artifact/{*path}",
            get(handlers::artifact_get)
                .post(handlers::artifact_store)
                .delete(handlers::artifact_delete),
        )
        .route("/", delete(handlers::delete_all))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}
