mod handlers;
mod router;

pub use handlers::{AppState, DeleteResponse, StoreResponse};
pub use router::create_router;

use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Serve the HTTP API until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    max_body_bytes: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("HTTP server listening on http://{}", listener.local_addr()?);
    let app = create_router(state, max_body_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
