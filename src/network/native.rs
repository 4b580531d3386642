//! Low-latency, reduced-semantics network driver
//!
//! Attaches a host-native virtual network interface at VM boot time
//! only; the host virtualization API's configuration is immutable once
//! the VM is running, so any dynamic operation is `Unsupported`.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{DaemonError, Result};
use crate::network::backend::{AttachOutcome, AttachRequest, NetworkBackend};

/// State shared by every container attached to one native-driver
/// network; a single mutex serializes IP allocation so independent
/// per-connect allocator copies can't race (§4.4).
struct SharedNetwork {
    allocated: HashSet<u8>,
}

pub struct NativeBackend {
    networks: DashMap<String, Mutex<SharedNetwork>>,
    attached_once: DashMap<String, ()>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self { networks: DashMap::new(), attached_once: DashMap::new() }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkBackend for NativeBackend {
    async fn create_bridge(&self, network_id: &str, _subnet: &str, _gateway: Ipv4Addr) -> Result<()> {
        self.networks
            .insert(network_id.to_string(), Mutex::new(SharedNetwork { allocated: HashSet::from([0, 1]) }));
        Ok(())
    }

    async fn delete_bridge(&self, network_id: &str) -> Result<()> {
        self.networks.remove(network_id);
        Ok(())
    }

    async fn attach(&self, req: AttachRequest<'_>) -> Result<AttachOutcome> {
        if self.attached_once.contains_key(req.container_id) {
            return Err(DaemonError::Unsupported(
                "this container already has a native-driver attachment; recreate the container with --network to change it".to_string(),
            ));
        }

        let network = self
            .networks
            .get(req.network_id)
            .ok_or_else(|| DaemonError::not_found("network", req.network_id))?;
        {
            let mut guard = network.lock();
            let octet = req.ipv4.octets()[3];
            if !guard.allocated.insert(octet) {
                return Err(DaemonError::Conflict(format!("{} already allocated on this network", req.ipv4)));
            }
        }

        self.attached_once.insert(req.container_id.to_string(), ());
        Ok(AttachOutcome::default())
    }

    async fn detach(
        &self,
        _container_id: &str,
        _network_id: &str,
        _device_name: &str,
        _vm: Option<Arc<crate::runtime::VmHandle>>,
    ) -> Result<()> {
        Err(DaemonError::Unsupported(
            "dynamic attach/detach is not supported on the native network backend; recreate the container with --network to change its attachment".to_string(),
        ))
    }

    fn supports_dynamic_attach(&self) -> bool {
        false
    }

    fn supports_port_mapping(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_dynamic_connect_on_running_container() {
        let backend = NativeBackend::new();
        backend.create_bridge("net1", "172.20.0.0/16", Ipv4Addr::new(172, 20, 0, 1)).await.unwrap();

        let err = backend.detach("c1", "net1", "eth0", None).await.unwrap_err();
        assert!(matches!(err, DaemonError::Unsupported(_)));
    }
}
