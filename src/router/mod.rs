//! Thin external HTTP surface
//!
//! Mirrors the teacher's `router::build_router` / `AppState` shape,
//! translating the Container/Network/System operations named in §6 into
//! calls on the core managers. Field-for-field Docker Engine API wire
//! fidelity (multiplexed attach streams, the full filter-key surface,
//! etc.) is explicitly out of scope (§1) — this exists so the core is
//! exercised end-to-end, not to pass Docker's own compatibility suite.

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::Configuration;
use crate::container::ContainerManager;
use crate::network::NetworkManager;

/// Shared across every handler, mirroring the teacher's `router::AppState`.
#[derive(Clone)]
pub struct AppState {
    pub containers: Arc<ContainerManager>,
    pub networks: Arc<NetworkManager>,
    pub config: Arc<Configuration>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/containers/json", get(handlers::containers::list))
        .route("/containers/create", post(handlers::containers::create))
        .route("/containers/:id/json", get(handlers::containers::inspect))
        .route("/containers/:id/start", post(handlers::containers::start))
        .route("/containers/:id/stop", post(handlers::containers::stop))
        .route("/containers/:id/kill", post(handlers::containers::kill))
        .route("/containers/:id/wait", post(handlers::containers::wait))
        .route("/containers/:id", delete(handlers::containers::remove))
        .route("/containers/:id/networks/:network", post(handlers::containers::connect))
        .route("/containers/:id/networks/:network", delete(handlers::containers::disconnect))
        .route("/networks", get(handlers::networks::list))
        .route("/networks/create", post(handlers::networks::create))
        .route("/networks/:id", get(handlers::networks::inspect))
        .route("/networks/:id", delete(handlers::networks::remove))
        .route("/_ping", get(handlers::system::ping))
        .route("/version", get(handlers::system::version))
        .route("/info", get(handlers::system::info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
