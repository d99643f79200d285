//! Central registry that devices dial into
//!
//! Accepts device links over WebSocket, keeps the latest heartbeat, metrics and command
//! results per site, and exposes a small REST surface for operators.
//!
//! ## Endpoints
//!
//! - `WS /ws` - Device link (first frame must be `authenticate`)
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/sites` - Provisioned and connected sites with online status
//! - `GET /api/v1/sites/:id` - Site detail with recent command results
//! - `POST /api/v1/sites/:id/commands` - Send a command to a connected device
//! - `POST /api/v1/sites/:id/phase` - Switch the playback phase of a connected device
//! - `POST /api/v1/sites/:id/credentials` - Issue or rotate the api key of a site

pub mod credentials;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::RegistryState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: RegistryState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/v1/health", get(routes::health_check))
        .route("/api/v1/sites", get(routes::list_sites))
        .route("/api/v1/sites/:id", get(routes::get_site))
        .route("/api/v1/sites/:id/commands", post(routes::send_command))
        .route("/api/v1/sites/:id/phase", post(routes::set_phase))
        .route(
            "/api/v1/sites/:id/credentials",
            post(routes::issue_credentials),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve the registry in a background task. Returns the bound address.
pub async fn spawn_registry_server(
    bind_addr: SocketAddr,
    state: RegistryState,
) -> anyhow::Result<SocketAddr> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("registry listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("registry server error: {e}");
        }
    });

    Ok(addr)
}
