//! Capability-probed network driver interface
//!
//! NetworkManager never special-cases a backend by name; it asks the
//! driver what it supports (§9: "Capability probing avoids scattering
//! backend-specific conditionals").

use async_trait::async_trait;

use crate::error::Result;
use crate::runtime::VmHandle;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Parameters for attaching one container to one network.
pub struct AttachRequest<'a> {
    pub container_id: &'a str,
    pub network_id: &'a str,
    pub device_name: &'a str,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: &'a str,
    pub vm: Arc<VmHandle>,
}

/// Everything a network driver produces for one attachment, persisted
/// as part of the `NetworkAttachment` record.
#[derive(Debug, Clone, Default)]
pub struct AttachOutcome {
    pub host_vsock_port: Option<u32>,
    pub helper_vsock_port: Option<u32>,
}

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn create_bridge(&self, network_id: &str, subnet: &str, gateway: Ipv4Addr) -> Result<()>;

    async fn delete_bridge(&self, network_id: &str) -> Result<()>;

    async fn attach(&self, req: AttachRequest<'_>) -> Result<AttachOutcome>;

    async fn detach(
        &self,
        container_id: &str,
        network_id: &str,
        device_name: &str,
        vm: Option<Arc<VmHandle>>,
    ) -> Result<()>;

    fn supports_dynamic_attach(&self) -> bool;

    fn supports_port_mapping(&self) -> bool;
}
