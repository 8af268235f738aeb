use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

pub const HEALTH_STATUS: &str = "Signaling server is running";

/// State shared by every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct RelayState {
    pub router: MessageRouter,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            router: MessageRouter::new(registry),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: HEALTH_STATUS.to_string(),
            users: self.router.registry().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub users: usize,
}

/// GET /health - relay liveness plus the number of registered identities
pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(state.health())
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler(State(state): State<RelayState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
