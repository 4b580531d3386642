//! Container handlers: Create, Start, Stop, Kill, Remove, Wait,
//! Inspect, List, and network attach/detach (§6).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::container::{Caller, ContainerSpec, HostConfig, Phase};
use crate::error::{DaemonError, Result};
use crate::network::ConnectOptions;
use crate::router::AppState;
use crate::store::RestartPolicy;

#[derive(Debug, Deserialize)]
pub struct RestartPolicyDto {
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct HostConfigDto {
    #[serde(rename = "RestartPolicy", default)]
    restart_policy: Option<RestartPolicyDto>,
    #[serde(rename = "NetworkMode", default)]
    network_mode: Option<String>,
    #[serde(rename = "Binds", default)]
    binds: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Cmd", default)]
    cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "HostConfig", default)]
    host_config: HostConfigDto,
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    name: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<CreateContainerRequest>,
) -> Result<Json<Value>> {
    let spec = ContainerSpec {
        name: query.name,
        image: body.image,
        command: body.cmd,
        env: body.env,
        labels: body.labels,
        host: HostConfig {
            restart_policy: body
                .host_config
                .restart_policy
                .map(|p| RestartPolicy::parse(&p.name))
                .unwrap_or(RestartPolicy::No),
            network_mode: body.host_config.network_mode.unwrap_or_else(|| "default".to_string()),
            binds: body.host_config.binds,
        },
        internal: false,
    };

    let id = state.containers.create(spec).await?;
    Ok(Json(json!({ "Id": id })))
}

pub async fn start(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    state.containers.start(&id).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    t: Option<u64>,
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<Json<Value>> {
    let timeout = query.t.map(std::time::Duration::from_secs);
    state.containers.stop(&id, timeout, Caller::User).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct KillQuery {
    signal: Option<String>,
}

pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<Json<Value>> {
    let signal = match query.signal {
        Some(s) => parse_signal(&s)?,
        None => libc::SIGKILL,
    };
    state.containers.kill(&id, signal).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    force: bool,
    #[serde(rename = "v", default)]
    remove_volumes: bool,
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<Value>> {
    state.containers.remove(&id, query.force, query.remove_volumes, Caller::User).await?;
    Ok(Json(json!({})))
}

pub async fn wait(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let exit_code = state.containers.wait(&id).await?;
    Ok(Json(json!({ "StatusCode": exit_code })))
}

pub async fn inspect(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let container = state.containers.inspect(&id)?;
    Ok(Json(render(&container)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    all: bool,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Value> {
    let containers = state.containers.list(false);
    let rendered: Vec<Value> = containers
        .into_iter()
        .filter(|c| query.all || c.phase == Phase::Running)
        .map(|c| render(&c))
        .collect();
    Json(Value::Array(rendered))
}

#[derive(Debug, Deserialize, Default)]
pub struct ConnectBody {
    #[serde(rename = "IPAMConfig", default)]
    ipam: Option<IpamConfigDto>,
}

#[derive(Debug, Deserialize, Default)]
pub struct IpamConfigDto {
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Path((id, network)): Path<(String, String)>,
    Json(body): Json<ConnectBody>,
) -> Result<Json<Value>> {
    let preferred_ip = body
        .ipam
        .and_then(|i| i.ipv4_address)
        .map(|s| Ipv4Addr::from_str(&s))
        .transpose()
        .map_err(|_| DaemonError::InvalidArgument("malformed IPv4 address".to_string()))?;

    state
        .containers
        .attach_network(&id, &network, ConnectOptions { preferred_ip })
        .await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize, Default)]
pub struct DisconnectQuery {
    #[serde(default)]
    force: bool,
}

pub async fn disconnect(
    State(state): State<AppState>,
    Path((id, network)): Path<(String, String)>,
    Query(query): Query<DisconnectQuery>,
) -> Result<Json<Value>> {
    state.containers.detach_network(&id, &network, query.force).await?;
    Ok(Json(json!({})))
}

fn parse_signal(s: &str) -> Result<i32> {
    if let Ok(n) = s.parse::<i32>() {
        return Ok(n);
    }
    let normalized = s.trim_start_matches("SIG").to_ascii_uppercase();
    match normalized.as_str() {
        "HUP" => Ok(libc::SIGHUP),
        "INT" => Ok(libc::SIGINT),
        "QUIT" => Ok(libc::SIGQUIT),
        "KILL" => Ok(libc::SIGKILL),
        "TERM" => Ok(libc::SIGTERM),
        "USR1" => Ok(libc::SIGUSR1),
        "USR2" => Ok(libc::SIGUSR2),
        "STOP" => Ok(libc::SIGSTOP),
        "CONT" => Ok(libc::SIGCONT),
        _ => Err(DaemonError::InvalidArgument(format!("unknown signal: {s}"))),
    }
}

#[derive(Serialize)]
struct ContainerView<'a> {
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Names")]
    names: Vec<String>,
    #[serde(rename = "Image")]
    image: &'a str,
    #[serde(rename = "State")]
    state: &'static str,
    #[serde(rename = "ExitCode")]
    exit_code: Option<i32>,
    #[serde(rename = "Labels")]
    labels: &'a HashMap<String, String>,
}

fn render(c: &crate::container::Container) -> Value {
    serde_json::to_value(ContainerView {
        id: &c.id,
        names: vec![format!("/{}", c.name)],
        image: &c.image,
        state: c.phase.as_str(),
        exit_code: c.exit_code,
        labels: &c.labels,
    })
    .unwrap_or(json!({}))
}
