//! Omnicron Server — the distribution layer.
//!
//! Commands arrive over WebSocket connections, are routed by stream type to a
//! registered aggregate, and the events they commit are broadcast to every
//! other connection subscribed to a matching stream.

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;

/// Builds the HTTP application: `/health` and the WebSocket endpoint.
pub fn app(state: state::AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
