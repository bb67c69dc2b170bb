//! Metrics and health endpoints
//!
//! - `GET /metrics`: chain access metrics in Prometheus text format
//! - `GET /health`: service health as JSON, 503 when the monitor or node is down

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::service::SettlementService;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn router(service: Arc<SettlementService>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(service)
}

pub async fn metrics(State(service): State<Arc<SettlementService>>) -> Response {
    match service.chain_metrics_text() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn health(State(service): State<Arc<SettlementService>>) -> Response {
    let health = service.health().await;
    let status = if health.running && health.node.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

/// Serve until the shutdown flag flips.
pub async fn serve(
    service: Arc<SettlementService>,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics endpoint listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
