//! Relay routes.

pub mod health;
pub mod proxy;

use axum::Router;

use crate::server::AppState;

/// Create the relay router with all routes mounted.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/proxy", proxy::router())
        .nest("/health", health::router())
        .with_state(state)
}
