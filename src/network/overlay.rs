//! Full-semantics network driver: hot-plug attach over vsock + helper VM

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::control_plane::ControlPlaneSupervisor;
use crate::error::{DaemonError, Result};
use crate::network::backend::{AttachOutcome, AttachRequest, NetworkBackend};
use crate::network::relay::{FrameRelay, PortAllocator};

#[derive(Serialize)]
struct CreateBridgeParams<'a> {
    network_id: &'a str,
    subnet: &'a str,
    gateway: String,
}

#[derive(Deserialize)]
struct CreateBridgeResult {
    #[allow(dead_code)]
    bridge_name: String,
}

#[derive(Serialize)]
struct DeleteBridgeParams<'a> {
    network_id: &'a str,
}

#[derive(Serialize)]
struct AttachContainerParams<'a> {
    network_id: &'a str,
    container_id: &'a str,
    mac: &'a str,
    vsock_port: u32,
}

#[derive(Serialize)]
struct DetachContainerParams<'a> {
    network_id: &'a str,
    container_id: &'a str,
}

#[derive(Serialize)]
struct ConfigureNetworkParams<'a> {
    device_name: &'a str,
    ip: String,
    netmask: String,
    gateway: String,
    mac: &'a str,
    vsock_port: u32,
}

#[derive(Serialize)]
struct TeardownNetworkParams<'a> {
    device_name: &'a str,
}

pub struct OverlayBackend {
    control_plane: Arc<ControlPlaneSupervisor>,
    ports: PortAllocator,
    relays: DashMap<(String, String), (FrameRelay, u32)>,
}

impl OverlayBackend {
    pub fn new(control_plane: Arc<ControlPlaneSupervisor>) -> Self {
        Self { control_plane, ports: PortAllocator::new(), relays: DashMap::new() }
    }
}

#[async_trait]
impl NetworkBackend for OverlayBackend {
    async fn create_bridge(&self, network_id: &str, subnet: &str, gateway: std::net::Ipv4Addr) -> Result<()> {
        let helper = self.control_plane.helper_vm()?;
        let _: CreateBridgeResult = helper
            .init_channel()
            .call(
                "CreateBridge",
                CreateBridgeParams { network_id, subnet, gateway: gateway.to_string() },
            )
            .await?;
        info!(network_id, "overlay bridge created");
        Ok(())
    }

    async fn delete_bridge(&self, network_id: &str) -> Result<()> {
        let helper = self.control_plane.helper_vm()?;
        let _: serde_json::Value = helper
            .init_channel()
            .call("DeleteBridge", DeleteBridgeParams { network_id })
            .await?;
        Ok(())
    }

    async fn attach(&self, req: AttachRequest<'_>) -> Result<AttachOutcome> {
        let helper = self.control_plane.helper_vm()?;
        let (host_port, helper_port) = self.ports.allocate();

        let netmask = std::net::Ipv4Addr::new(255, 255, 0, 0);

        req.vm
            .tap_forwarder()
            .call::<_, serde_json::Value>(
                "ConfigureNetwork",
                ConfigureNetworkParams {
                    device_name: req.device_name,
                    ip: req.ipv4.to_string(),
                    netmask: netmask.to_string(),
                    gateway: req.gateway.to_string(),
                    mac: req.mac,
                    vsock_port: host_port,
                },
            )
            .await?;

        let _: serde_json::Value = helper
            .init_channel()
            .call(
                "AttachContainer",
                AttachContainerParams {
                    network_id: req.network_id,
                    container_id: req.container_id,
                    mac: req.mac,
                    vsock_port: helper_port,
                },
            )
            .await?;

        let container_stream = req.vm.dial_vsock(host_port).await?;
        let helper_stream = helper.dial_vsock(helper_port).await?;
        let relay = FrameRelay::spawn(container_stream, helper_stream);

        self.relays.insert(
            (req.container_id.to_string(), req.network_id.to_string()),
            (relay, host_port),
        );

        Ok(AttachOutcome { host_vsock_port: Some(host_port), helper_vsock_port: Some(helper_port) })
    }

    async fn detach(
        &self,
        container_id: &str,
        network_id: &str,
        device_name: &str,
        vm: Option<Arc<crate::runtime::VmHandle>>,
    ) -> Result<()> {
        let key = (container_id.to_string(), network_id.to_string());
        if let Some((_, (relay, host_port))) = self.relays.remove(&key) {
            relay.shutdown().await;
            self.ports.release(host_port);
        }

        if let Some(vm) = vm {
            let _: std::result::Result<serde_json::Value, DaemonError> = vm
                .tap_forwarder()
                .call("TeardownNetwork", TeardownNetworkParams { device_name })
                .await;
        }

        if let Ok(helper) = self.control_plane.helper_vm() {
            let _: std::result::Result<serde_json::Value, DaemonError> = helper
                .init_channel()
                .call("DetachContainer", DetachContainerParams { network_id, container_id })
                .await;
        }

        Ok(())
    }

    fn supports_dynamic_attach(&self) -> bool {
        true
    }

    fn supports_port_mapping(&self) -> bool {
        true
    }
}
