//! HTTP endpoints for probes and monitoring
//!
//! Serves `/health`, `/readyz` and, with the `metrics` feature, `/metrics`.

mod handlers;
mod server;

pub use handlers::{HealthResponse, ReadyResponse};
pub use server::{router, run_server, ServerState};
