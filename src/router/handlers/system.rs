//! System handlers: Ping, Version, Info (§6).

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::router::AppState;

pub async fn ping() -> impl IntoResponse {
    "OK"
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "Version": env!("CARGO_PKG_VERSION"),
        "ApiVersion": "1.51",
        "MinAPIVersion": "1.24",
        "Os": "linux",
        "Arch": "amd64",
    }))
}

pub async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let containers = state.containers.list(true);
    let running = containers.iter().filter(|c| c.phase == crate::container::Phase::Running).count();
    let networks = state.networks.list_networks().await.unwrap_or_default();

    Json(json!({
        "Containers": containers.len(),
        "ContainersRunning": running,
        "ContainersStopped": containers.len() - running,
        "Networks": networks.len(),
        "NetworkBackend": state.config.network_backend.to_string(),
        "ServerVersion": env!("CARGO_PKG_VERSION"),
    }))
}
