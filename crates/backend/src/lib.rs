//! The transport shell: an axum router exposing the sync WebSocket endpoint
//! and the prometheus scrape endpoint, plus the registry that maps client
//! groups to their view syncers.

mod registry;
mod subs;
mod ws;

pub use registry::{
    spawn_version_poller,
    SyncerRegistry,
    SyncerRegistryConfig,
};

use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use prometheus::{
    Encoder as _,
    TextEncoder,
};

#[derive(Clone)]
pub struct RouterState {
    pub registry: Arc<SyncerRegistry>,
}

pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/sync/{version}/connect", get(subs::sync))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

async fn metrics_endpoint() -> impl axum::response::IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics::SYNC_METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
    }
    (
        [(http::header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    router: Router,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
