//! Liveness and readiness endpoints
//!
//! - `GET /healthz`: the process is up
//! - `GET /readyz`: both controllers are running and the last ping succeeded

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vnode_common::{Error, Result};

/// Source of the readiness answer
pub trait ReadinessProbe: Send + Sync {
    /// `Ok` when ready, otherwise a reason for the operator
    fn check(&self) -> std::result::Result<(), String>;
}

/// Router serving the health endpoints
pub fn router(probe: Arc<dyn ReadinessProbe>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(probe)
}

async fn readyz(State(probe): State<Arc<dyn ReadinessProbe>>) -> impl IntoResponse {
    match probe.check() {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(reason) => {
            debug!(reason, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, reason)
        }
    }
}

/// Serve the health endpoints on `addr` until `ctx` is cancelled
pub async fn serve(
    addr: SocketAddr,
    probe: Arc<dyn ReadinessProbe>,
    ctx: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("health", format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Starting health server");

    axum::serve(listener, router(probe))
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
        .map_err(|e| Error::internal_with_context("health", format!("server error: {}", e)))
}
