//! Axum HTTP server for health probes and metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerStatus;
use crate::{Error, Result};

use super::handlers;

/// State shared with the request handlers
pub struct ServerState {
    pub status: Arc<ControllerStatus>,
    /// Readiness also requires holding the lease
    pub leader_election: bool,
}

pub fn router(state: Arc<ServerState>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/readyz", get(handlers::readyz));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `stop` turns true
pub async fn run_server(
    state: Arc<ServerState>,
    port: u16,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind {}: {}", addr, e)))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|s| *s).await;
        })
        .await
        .map_err(|e| Error::ConfigError(format!("HTTP server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
