//! Network handlers: Create, Delete, Inspect, List (§6).
//!
//! Connect/Disconnect live under the container handlers
//! (`/containers/:id/networks/:network`) since they're driven from the
//! container side in this daemon's object model.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::network::NetworkSpec;
use crate::router::AppState;
use crate::store::NetworkRecord;

#[derive(Debug, Deserialize)]
pub struct CreateNetworkRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: Option<String>,
    #[serde(rename = "IPAM", default)]
    ipam: Option<IpamDto>,
    #[serde(rename = "Options", default)]
    options: HashMap<String, String>,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct IpamDto {
    #[serde(rename = "Config", default)]
    config: Vec<IpamConfigEntry>,
}

#[derive(Debug, Deserialize)]
pub struct IpamConfigEntry {
    #[serde(rename = "Subnet", default)]
    subnet: Option<String>,
}

pub async fn create(State(state): State<AppState>, Json(body): Json<CreateNetworkRequest>) -> Result<Json<Value>> {
    let subnet = body.ipam.and_then(|i| i.config.into_iter().find_map(|c| c.subnet));

    let spec = NetworkSpec { name: body.name, driver: body.driver, subnet, options: body.options, labels: body.labels };
    let record = state.networks.create_network(spec).await?;
    Ok(Json(json!({ "Id": record.id })))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    state.networks.delete_network(&id).await?;
    Ok(Json(json!({})))
}

pub async fn inspect(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let (network, attachments) = state.networks.inspect_network(&id).await?;
    Ok(Json(render(&network, attachments.len())))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>> {
    let networks = state.networks.list_networks().await?;
    Ok(Json(Value::Array(networks.iter().map(|n| render(n, 0)).collect())))
}

fn render(n: &NetworkRecord, endpoint_count: usize) -> Value {
    json!({
        "Id": n.id,
        "Name": n.name,
        "Driver": n.driver,
        "IPAM": { "Config": [{ "Subnet": n.subnet, "Gateway": n.gateway }] },
        "Options": n.options,
        "Labels": n.labels,
        "Internal": false,
        "EndpointCount": endpoint_count,
    })
}
