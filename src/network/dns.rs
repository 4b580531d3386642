//! DNS topology propagation
//!
//! Pushes a full, idempotent snapshot of network membership to each
//! container's embedded resolver whenever membership changes. The
//! snapshot is the complete state, not a delta, so a lost push is
//! healed by the next trigger (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::runtime::VmHandle;

#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub container_name: String,
    pub aliases: Vec<String>,
    pub ipv4: String,
}

/// `map<networkName, list<peer>>` for one container's attached networks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsSnapshot {
    pub networks: HashMap<String, Vec<PeerRecord>>,
}

#[derive(Serialize)]
struct UpdateDnsMappingsParams<'a> {
    networks: &'a HashMap<String, Vec<PeerRecord>>,
}

/// Best-effort push: failures are logged and swallowed, per §4.6/§7 —
/// the next topology change resends the complete snapshot.
pub async fn push_topology(vm: &Arc<VmHandle>, snapshot: &DnsSnapshot) {
    let result: Result<serde_json::Value, _> = vm
        .tap_forwarder()
        .call("UpdateDNSMappings", UpdateDnsMappingsParams { networks: &snapshot.networks })
        .await;

    if let Err(e) = result {
        warn!(container = %vm.id, error = %e, "dns topology push failed, will resend on next trigger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_as_expected_shape() {
        let mut snapshot = DnsSnapshot::default();
        snapshot.networks.insert(
            "bridge".to_string(),
            vec![PeerRecord { container_name: "web".to_string(), aliases: vec![], ipv4: "172.17.0.2".to_string() }],
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["networks"]["bridge"][0]["container_name"] == "web");
    }
}
