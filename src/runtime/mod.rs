//! Thin wrapper over the external VM runtime
//!
//! `Runtime` is the daemon's only point of contact with the hypervisor:
//! create / start / stop / wait / exec / signal / dial a fresh vsock
//! stream. Everything above this layer (ContainerManager, the network
//! backends) only ever talks to a [`VmHandle`].

pub mod control;
mod vm;

pub use control::RpcClient;
pub use vm::{VmBootSpec, VmHandle};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};

/// First vsock CID handed to a container VM. Lower values are reserved
/// by the hypervisor/host (0 = hypervisor, 1 = local, 2 = host).
const FIRST_GUEST_CID: u32 = 100;

pub struct Runtime {
    hypervisor_bin: String,
    kernel_path: PathBuf,
    next_cid: AtomicU32,
    handles: DashMap<String, Arc<VmHandle>>,
}

impl Runtime {
    pub fn new(hypervisor_bin: impl Into<String>, kernel_path: PathBuf) -> Self {
        Self {
            hypervisor_bin: hypervisor_bin.into(),
            kernel_path,
            next_cid: AtomicU32::new(FIRST_GUEST_CID),
            handles: DashMap::new(),
        }
    }

    pub fn kernel_path(&self) -> &PathBuf {
        &self.kernel_path
    }

    /// Boots a new VM for `id`. Discards any leftover runtime handle for
    /// the same id first (restart-recreate after an unclean daemon exit).
    pub async fn create(&self, mut spec: VmBootSpec) -> Result<Arc<VmHandle>> {
        self.handles.remove(&spec.id);

        if spec.kernel_path.as_os_str().is_empty() {
            spec.kernel_path = self.kernel_path.clone();
        }

        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        let child = vm::spawn(&self.hypervisor_bin, cid, &spec).await?;
        let handle = Arc::new(VmHandle::new(spec.id.clone(), cid, child));

        self.handles.insert(spec.id.clone(), handle.clone());
        info!(id = %spec.id, cid, "VM created");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<VmHandle>> {
        self.handles.get(id).map(|h| h.clone())
    }

    pub fn has(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        if let Some((_, handle)) = self.handles.remove(id) {
            if handle.is_alive() {
                warn!(id, "removing VM that still appears alive; killing");
                handle.kill(libc::SIGKILL).ok();
                let _ = handle.wait_exit().await;
            }
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("hypervisor_bin", &self.hypervisor_bin)
            .field("active", &self.handles.len())
            .finish()
    }
}

pub(crate) fn not_running(id: &str) -> DaemonError {
    DaemonError::InvalidState(format!("container {id} is not running"))
}
