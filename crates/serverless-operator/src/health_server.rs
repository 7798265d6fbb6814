//! `/healthz` endpoint backed by the reconciler health probe

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use serverless_function::HealthChecker;

/// Router serving `GET /healthz`
pub fn router(checker: Arc<HealthChecker>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(checker)
}

async fn healthz(State(checker): State<Arc<HealthChecker>>) -> (StatusCode, String) {
    match checker.check().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

/// Serve the health endpoint until `cancel` fires
pub async fn serve(
    address: SocketAddr,
    checker: Arc<HealthChecker>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "health endpoint listening");
    axum::serve(listener, router(checker))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
