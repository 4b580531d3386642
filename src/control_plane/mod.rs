//! Helper-VM supervision
//!
//! Ensures the networking helper VM (a distinguished, reserved container
//! named `arca-control-plane`) is running and reachable, and hands out
//! its control-channel handle to the overlay backend. The supervisor
//! itself never creates or starts the container — the Reconciler owns
//! that ("the only code path that writes first-run records", §9) — it
//! only tracks which runtime handle is currently "the" helper VM.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::runtime::{Runtime, VmHandle};

pub const HELPER_CONTAINER_NAME: &str = "arca-control-plane";

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
}

/// Tracks the currently-known-running helper VM and exposes its control
/// channel to the overlay backend. Degraded mode (no known-healthy
/// helper VM) causes overlay operations to fail `ControlPlaneUnavailable`
/// rather than hang.
pub struct ControlPlaneSupervisor {
    runtime: Arc<Runtime>,
    helper_id: RwLock<Option<String>>,
}

impl ControlPlaneSupervisor {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime, helper_id: RwLock::new(None) }
    }

    pub fn set_helper_id(&self, id: impl Into<String>) {
        *self.helper_id.write() = Some(id.into());
    }

    pub fn helper_id(&self) -> Option<String> {
        self.helper_id.read().clone()
    }

    /// Returns the live handle for the helper VM, or
    /// `ControlPlaneUnavailable` if it isn't known or isn't running.
    pub fn helper_vm(&self) -> Result<Arc<VmHandle>> {
        let id = self.helper_id.read().clone().ok_or(DaemonError::ControlPlaneUnavailable)?;
        self.runtime.get(&id).ok_or(DaemonError::ControlPlaneUnavailable)
    }

    /// Polls `GetHealth` with a bounded timeout, used by the Reconciler
    /// right after starting the helper VM.
    pub async fn wait_healthy(&self, timeout: Duration) -> Result<()> {
        let vm = self.helper_vm()?;
        let result = tokio::time::timeout(timeout, async {
            loop {
                let resp: std::result::Result<HealthResponse, DaemonError> =
                    vm.init_channel().call("GetHealth", serde_json::json!({})).await;
                match resp {
                    Ok(h) if h.ok => return,
                    _ => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!("control plane healthy");
                Ok(())
            }
            Err(_) => {
                warn!("control plane did not become healthy within timeout; entering degraded mode");
                Err(DaemonError::ControlPlaneUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_helper_is_unavailable() {
        let runtime = Arc::new(Runtime::new("qemu-system-x86_64", "/boot/vmlinux".into()));
        let supervisor = ControlPlaneSupervisor::new(runtime);
        assert!(matches!(supervisor.helper_vm(), Err(DaemonError::ControlPlaneUnavailable)));
    }
}
