//! Facade over the two network drivers and the network/attachment store

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::NetworkBackendKind;
use crate::error::{DaemonError, Result};
use crate::id::IDRegistry;
use crate::network::backend::{AttachRequest, NetworkBackend};
use crate::network::dns::{DnsSnapshot, PeerRecord};
use crate::network::ipam::{generate_mac, next_device_name, Ipam};
use crate::network::model::{ConnectOptions, NetworkSpec};
use crate::network::native::NativeBackend;
use crate::network::overlay::OverlayBackend;
use crate::runtime::VmHandle;
use crate::store::{AttachmentRecord, NetworkRecord, StateStore};

pub const DEFAULT_NETWORK_NAME: &str = "bridge";
pub const DEFAULT_SUBNET: &str = "172.17.0.0/16";

pub struct NetworkManager {
    store: Arc<StateStore>,
    ids: IDRegistry,
    overlay: Arc<OverlayBackend>,
    native: Arc<NativeBackend>,
    default_backend: NetworkBackendKind,
    ipam: dashmap::DashMap<String, Mutex<Ipam>>,
}

impl NetworkManager {
    pub fn new(
        store: Arc<StateStore>,
        overlay: Arc<OverlayBackend>,
        native: Arc<NativeBackend>,
        default_backend: NetworkBackendKind,
    ) -> Self {
        Self { store, ids: IDRegistry::new(), overlay, native, default_backend, ipam: dashmap::DashMap::new() }
    }

    fn backend_for(&self, driver: &str) -> Arc<dyn NetworkBackend> {
        match driver {
            "native" => self.native.clone(),
            _ => self.overlay.clone(),
        }
    }

    /// Rebuilds the name registry and per-network IPAM state from the
    /// store, then ensures the default `bridge` network exists.
    pub async fn init(&self) -> Result<()> {
        let networks = self.store.list_networks().await?;
        self.ids.rebuild(networks.iter().map(|n| (n.id.clone(), n.name.clone())));

        for network in &networks {
            let attachments = self.store.attachments_for_network(&network.id).await?;
            let in_use = attachments
                .iter()
                .filter_map(|a| Ipv4Addr::from_str(&a.ipv4).ok());
            if let Ok(ipam) = Ipam::rebuild(&network.subnet, in_use) {
                self.ipam.insert(network.id.clone(), Mutex::new(ipam));
            }
        }

        if !networks.iter().any(|n| n.name == DEFAULT_NETWORK_NAME) {
            // Reconciler step 4: default network metadata only. The
            // backend-level CreateBridge call happens later, in step 6,
            // once the helper VM is confirmed running (`reapply_all_bridges`).
            self.persist_network_record(NetworkSpec {
                name: DEFAULT_NETWORK_NAME.to_string(),
                driver: Some(self.default_backend.to_string()),
                subnet: Some(DEFAULT_SUBNET.to_string()),
                ..Default::default()
            })
            .await?;
        }

        Ok(())
    }

    /// Create a network: persist its record and apply it to the backend
    /// immediately. Used by the user-facing `CreateNetwork` operation.
    pub async fn create_network(&self, spec: NetworkSpec) -> Result<NetworkRecord> {
        let driver = spec.driver.clone().unwrap_or(self.default_backend.to_string());
        let record = self.persist_network_record(spec).await?;
        self.backend_for(&driver)
            .create_bridge(&record.id, &record.subnet, Ipv4Addr::from_str(&record.gateway).unwrap())
            .await?;
        Ok(record)
    }

    /// Persist network metadata without touching the backend. Used both
    /// by `create_network` and by startup default-network bootstrap,
    /// whose bridge is created later once the helper VM is confirmed up.
    async fn persist_network_record(&self, spec: NetworkSpec) -> Result<NetworkRecord> {
        validate_network_name(&spec.name)?;
        if self.ids.name_taken(&spec.name) {
            return Err(DaemonError::NameConflict(spec.name));
        }

        let driver = spec.driver.unwrap_or(self.default_backend.to_string());

        let subnet = match spec.subnet {
            Some(subnet) => {
                let existing = self.store.list_networks().await?;
                if existing.iter().any(|n| subnets_overlap(&subnet, &n.subnet).unwrap_or(false)) {
                    return Err(DaemonError::InvalidArgument(format!(
                        "subnet {subnet} overlaps an existing network"
                    )));
                }
                subnet
            }
            None => {
                let octet = self
                    .store
                    .allocate_subnet_octet()
                    .await?
                    .ok_or_else(|| DaemonError::ResourceExhausted("subnet pool exhausted".to_string()))?;
                format!("172.{octet}.0.0/16")
            }
        };

        let gateway = subnet_gateway(&subnet)?;
        let id = IDRegistry::generate_id();

        let record = NetworkRecord {
            id: id.clone(),
            name: spec.name.clone(),
            driver,
            subnet: subnet.clone(),
            gateway: gateway.to_string(),
            options: spec.options,
            labels: spec.labels,
            is_default: spec.name == DEFAULT_NETWORK_NAME,
            created_at: now_secs(),
        };

        self.store.save_network(&record).await?;
        self.ids.register(&id, &spec.name);
        self.ipam.insert(id.clone(), Mutex::new(Ipam::new(&subnet)?));

        info!(network_id = %id, name = %spec.name, %subnet, "network created");
        Ok(record)
    }

    pub async fn delete_network(&self, id_or_name: &str) -> Result<()> {
        let record = self.lookup(id_or_name).await?;

        if record.is_default {
            return Err(DaemonError::PermissionDenied("the default bridge network cannot be deleted".to_string()));
        }

        let attachments = self.store.attachments_for_network(&record.id).await?;
        if !attachments.is_empty() {
            return Err(DaemonError::Conflict(format!("network {} has active endpoints", record.name)));
        }

        self.backend_for(&record.driver).delete_bridge(&record.id).await?;
        self.store.delete_network(&record.id).await?;
        self.ids.unregister_name(&record.name);
        self.ipam.remove(&record.id);
        Ok(())
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkRecord>> {
        self.store.list_networks().await
    }

    pub async fn inspect_network(&self, id_or_name: &str) -> Result<(NetworkRecord, Vec<AttachmentRecord>)> {
        let record = self.lookup(id_or_name).await?;
        let attachments = self.store.attachments_for_network(&record.id).await?;
        Ok((record, attachments))
    }

    pub async fn lookup(&self, id_or_name: &str) -> Result<NetworkRecord> {
        let all = self.store.list_networks().await?;
        let ids: Vec<&str> = all.iter().map(|n| n.id.as_str()).collect();
        let id = self.ids.resolve(id_or_name, ids).map_err(|e| match e {
            crate::id::ResolveError::AmbiguousPrefix(p) => DaemonError::AmbiguousPrefix(p),
            crate::id::ResolveError::TooShort(r) => {
                DaemonError::InvalidArgument(format!("reference too short to resolve: {r}"))
            }
            crate::id::ResolveError::NotFound(_) => DaemonError::not_found("network", id_or_name),
        })?;
        all.into_iter()
            .find(|n| n.id == id)
            .ok_or_else(|| DaemonError::not_found("network", id_or_name))
    }

    /// Attach `container_id` (whose live VM handle is `vm`) to a network.
    pub async fn connect(
        &self,
        container_id: &str,
        network_ref: &str,
        existing_devices: &[String],
        opts: ConnectOptions,
        vm: Arc<VmHandle>,
    ) -> Result<AttachmentRecord> {
        let network = self.lookup(network_ref).await?;
        let backend = self.backend_for(&network.driver);

        let existing = self.store.attachments_for_container(container_id).await?;
        if existing.iter().any(|a| a.network_id == network.id) {
            return Err(DaemonError::Conflict(format!("already connected to network {}", network.name)));
        }

        if !existing.is_empty() && !backend.supports_dynamic_attach() {
            return Err(DaemonError::Unsupported(
                "this backend only supports a single attachment, made at container-create time".to_string(),
            ));
        }

        let device_name = next_device_name(existing_devices);
        let mac = generate_mac();
        let gateway = Ipv4Addr::from_str(&network.gateway)
            .map_err(|_| DaemonError::Internal(format!("stored gateway {} is not valid", network.gateway)))?;

        let ip = {
            let ipam = self
                .ipam
                .entry(network.id.clone())
                .or_insert_with(|| Mutex::new(Ipam::new(&network.subnet).expect("subnet validated at create")));
            ipam.lock().allocate(opts.preferred_ip)?
        };

        let outcome = backend
            .attach(AttachRequest {
                container_id,
                network_id: &network.id,
                device_name: &device_name,
                ipv4: ip,
                netmask: Ipv4Addr::new(255, 255, 0, 0),
                gateway,
                mac: &mac,
                vm,
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(ipam) = self.ipam.get(&network.id) {
                    ipam.lock().release(ip);
                }
                return Err(e);
            }
        };

        let record = AttachmentRecord {
            container_id: container_id.to_string(),
            network_id: network.id.clone(),
            device_name,
            ipv4: ip.to_string(),
            mac,
            host_vsock_port: outcome.host_vsock_port,
            helper_vsock_port: outcome.helper_vsock_port,
        };

        self.store.save_attachment(&record).await?;
        Ok(record)
    }

    pub async fn disconnect(
        &self,
        container_id: &str,
        network_ref: &str,
        force: bool,
        vm: Option<Arc<VmHandle>>,
    ) -> Result<()> {
        let network = self.lookup(network_ref).await?;
        let attachments = self.store.attachments_for_container(container_id).await?;
        let attachment = attachments.into_iter().find(|a| a.network_id == network.id);

        let attachment = match attachment {
            Some(a) => a,
            None if force => return Ok(()),
            None => return Err(DaemonError::InvalidState(format!("not connected to network {}", network.name))),
        };

        let backend = self.backend_for(&network.driver);
        backend.detach(container_id, &network.id, &attachment.device_name, vm).await?;

        if let Some(ipam) = self.ipam.get(&network.id) {
            if let Ok(ip) = Ipv4Addr::from_str(&attachment.ipv4) {
                ipam.lock().release(ip);
            }
        }

        self.store.delete_attachment(container_id, &network.id).await?;
        Ok(())
    }

    /// Complete DNS snapshot for one container's attached networks.
    pub async fn dns_snapshot_for(&self, container_id: &str, container_names: &dashmap::DashMap<String, String>) -> Result<DnsSnapshot> {
        let attachments = self.store.attachments_for_container(container_id).await?;
        let mut snapshot = DnsSnapshot::default();

        for attachment in attachments {
            let network = self.store.get_network(&attachment.network_id).await?;
            let Some(network) = network else { continue };

            let peers = self.store.attachments_for_network(&attachment.network_id).await?;
            let mut records = Vec::new();
            for peer in peers {
                let name = container_names.get(&peer.container_id).map(|v| v.clone()).unwrap_or(peer.container_id.clone());
                records.push(PeerRecord { container_name: name, aliases: vec![], ipv4: peer.ipv4 });
            }
            snapshot.networks.insert(network.name, records);
        }

        Ok(snapshot)
    }

    /// Every other container currently attached to `network_id`, used to
    /// fan a DNS push out to peers on membership change.
    pub async fn peers_of(&self, container_id: &str, network_id: &str) -> Result<Vec<String>> {
        let attachments = self.store.attachments_for_network(network_id).await?;
        Ok(attachments
            .into_iter()
            .filter(|a| a.container_id != container_id)
            .map(|a| a.container_id)
            .collect())
    }

    pub async fn networks_of(&self, container_id: &str) -> Result<Vec<AttachmentRecord>> {
        self.store.attachments_for_container(container_id).await
    }

    /// Reconciler step 6: idempotently re-create every persisted
    /// network's bridge in the (freshly started) helper VM.
    pub async fn reapply_all_bridges(&self) -> Result<()> {
        for network in self.store.list_networks().await? {
            let gateway = Ipv4Addr::from_str(&network.gateway)
                .unwrap_or_else(|_| Ipv4Addr::new(0, 0, 0, 0));
            if let Err(e) = self
                .backend_for(&network.driver)
                .create_bridge(&network.id, &network.subnet, gateway)
                .await
            {
                tracing::warn!(network_id = %network.id, error = %e, "failed to reapply network bridge");
            }
        }
        Ok(())
    }
}

fn validate_network_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(DaemonError::InvalidArgument("network name must be 1-63 characters".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(DaemonError::InvalidArgument(
            "network name may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// True if two CIDR strings' address ranges intersect (§3 "subnet does
/// not overlap any other existing network's subnet"). `None` on a
/// malformed operand rather than erroring here — callers treat an
/// unparsable stored subnet as non-overlapping and let the store's own
/// data stand.
fn subnets_overlap(a: &str, b: &str) -> Option<bool> {
    let (a_addr, a_len) = parse_cidr(a)?;
    let (b_addr, b_len) = parse_cidr(b)?;
    let shortest = a_len.min(b_len);
    let mask: u32 = if shortest == 0 { 0 } else { u32::MAX << (32 - shortest) };
    Some((a_addr & mask) == (b_addr & mask))
}

fn parse_cidr(cidr: &str) -> Option<(u32, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr = Ipv4Addr::from_str(addr).ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    Some((u32::from(addr), len))
}

fn subnet_gateway(subnet: &str) -> Result<Ipv4Addr> {
    let base = subnet
        .split('/')
        .next()
        .ok_or_else(|| DaemonError::InvalidArgument(format!("malformed subnet: {subnet}")))?;
    let mut octets = base.split('.');
    let a: u8 = octets.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let b: u8 = octets.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(Ipv4Addr::new(a, b, 0, 1))
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::ControlPlaneSupervisor;
    use crate::runtime::Runtime;

    #[test]
    fn identical_subnets_overlap() {
        assert_eq!(subnets_overlap("172.20.0.0/16", "172.20.0.0/16"), Some(true));
    }

    #[test]
    fn disjoint_subnets_do_not_overlap() {
        assert_eq!(subnets_overlap("172.20.0.0/16", "172.21.0.0/16"), Some(false));
    }

    #[test]
    fn narrower_subnet_inside_wider_one_overlaps() {
        assert_eq!(subnets_overlap("10.0.0.0/8", "10.5.0.0/16"), Some(true));
    }

    fn fresh_manager() -> NetworkManager {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let runtime = Arc::new(Runtime::new("true", "/boot/vmlinux".into()));
        let control_plane = Arc::new(ControlPlaneSupervisor::new(runtime));
        let overlay = Arc::new(OverlayBackend::new(control_plane));
        let native = Arc::new(NativeBackend::new());
        NetworkManager::new(store, overlay, native, NetworkBackendKind::Overlay)
    }

    #[tokio::test]
    async fn create_network_rejects_overlapping_explicit_subnet() {
        let manager = fresh_manager();
        manager
            .create_network(NetworkSpec {
                name: "n1".to_string(),
                driver: Some("native".to_string()),
                subnet: Some("172.20.0.0/16".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = manager
            .create_network(NetworkSpec {
                name: "n2".to_string(),
                driver: Some("native".to_string()),
                subnet: Some("172.20.0.0/16".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }
}
