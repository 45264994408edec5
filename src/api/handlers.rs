//! HTTP request handlers for the health and metrics endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tracing::error;

use crate::client::MessageQueue;

/// Application state shared across handlers.
pub struct AppState {
    pub registry: Registry,
    pub mq: Arc<MessageQueue>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    broker: String,
    mode: String,
}

/// Health check endpoint. Answers 503 while the broker connection is down.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = state.mq.connection_state();
    let (code, status) = if connection.is_connected() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broker: connection.to_string(),
            mode: state.mq.mode().to_string(),
        }),
    )
}

/// Prometheus text exposition of every registered collector.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_metrics(&state.registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

pub fn render_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
