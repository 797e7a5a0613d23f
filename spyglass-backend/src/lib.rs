pub mod backup;
pub mod config;
pub mod helpers;
pub mod hub;
pub mod monitor;
pub mod protocol;
pub mod retention;
pub mod sessions;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::{http::StatusCode, routing::get, Router};
use hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

pub struct AppState {
    pub hub: Hub,
}

// The ingress surface is tiny: a health probe and the subscription attach
// point. Anything bigger than this limit is not a legitimate request.
const REQUEST_BODY_LIMIT: usize = 64 * 1024;

// Request timeout applies to the upgrade handshake, not the long-lived
// subscriber connection that follows it
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the ingress router with the given hub handle
pub fn create_app(hub: Hub) -> Router {
    let state = Arc::new(AppState { hub });

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ws", get(ws_attach))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .with_state(state)
}

/// Upgrade the connection and hand the socket to the push hub.
async fn ws_attach(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move { state.hub.attach(socket).await })
}
