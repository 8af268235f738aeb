pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::{HealthStatus, RelayState};
pub use registry::{ConnectionRegistry, RelayConnection, RelayError};
pub use router::{ConnectionContext, DropReason, MessageRouter, RouteOutcome};

/// Builds the relay's HTTP surface.
///
/// WebSocket clients connect on `/` or `/api`; both also answer a plain GET
/// with the health document.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(websocket::relay_entry))
        .route("/api", get(websocket::relay_entry))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already bound listener.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}
