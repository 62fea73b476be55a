//! Request handlers for the health and metrics endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use super::server::ServerState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub ready: bool,
    pub caches_synced: bool,
    /// Absent when leader election is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<bool>,
}

/// Liveness: the process is up and serving
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: caches synced, and holding the lease when elections are on
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<ReadyResponse>) {
    let caches_synced = state.status.is_ready();
    let leader = state.leader_election.then(|| state.status.is_leader());
    let ready = caches_synced && leader.unwrap_or(true);

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            caches_synced,
            leader,
        }),
    )
}

/// Prometheus text exposition of the controller registry
#[cfg(feature = "metrics")]
pub async fn metrics() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        ),
    }
}
