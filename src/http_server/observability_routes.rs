//! Observability HTTP Routes
//!
//! Health, replication status, and counters.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use super::state::GatewayState;
use crate::observability::MetricsSnapshot;
use crate::replication::ManagerStatus;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Gateway status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub restore: &'static str,
    pub durability: &'static str,
    pub replication: ManagerStatus,
}

/// Create observability routes
pub fn observability_routes(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .merge(health_routes())
        .with_state(state)
}

/// Health check route, stateless
pub fn health_routes<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new().route("/health", get(health_handler))
}

async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (StatusCode::OK, Json(response))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let gateway = state.gateway();
    let response = StatusResponse {
        restore: gateway.restore_outcome().as_str(),
        durability: gateway.coordinator().policy().as_str(),
        replication: gateway.manager().status(),
    };

    let code = if response.replication.closed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(response))
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Json<MetricsSnapshot> {
    Json(state.gateway().metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ok"));
    }
}
