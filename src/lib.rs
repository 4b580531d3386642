//! arca-daemon core library
//!
//! Wires the container lifecycle manager, the dual-backend network
//! subsystem, and the persistence/reconciliation core together into one
//! [`Daemon`] handle. `router` is a thin external-facing HTTP layer over
//! this core (§6); everything that matters lives below it.

pub mod config;
pub mod container;
pub mod control_plane;
pub mod error;
pub mod id;
pub mod network;
pub mod reconciler;
pub mod router;
pub mod runtime;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use config::Configuration;
use container::ContainerManager;
use control_plane::ControlPlaneSupervisor;
use network::native::NativeBackend;
use network::overlay::OverlayBackend;
use network::NetworkManager;
use reconciler::Reconciler;
use runtime::Runtime;
use store::{ExitWal, StateStore};

/// Default hypervisor binary used to boot container VMs, overridable
/// environmentally — the core makes no assumption beyond "the runtime
/// can boot a Linux VM... and expose a byte-stream control channel" (§9).
const DEFAULT_HYPERVISOR_BIN: &str = "arca-hypervisor";

/// Every subsystem wired together, in the dependency order from §2:
/// StateStore, IDRegistry, IPAM -> Runtime, FrameRelay -> Backends ->
/// NetworkManager, ControlPlaneSupervisor -> ContainerManager.
pub struct Daemon {
    pub config: Arc<Configuration>,
    pub store: Arc<StateStore>,
    pub exit_wal: Arc<ExitWal>,
    pub runtime: Arc<Runtime>,
    pub control_plane: Arc<ControlPlaneSupervisor>,
    pub networks: Arc<NetworkManager>,
    pub containers: Arc<ContainerManager>,
}

impl Daemon {
    pub async fn bootstrap(config: Configuration) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(StateStore::open(&config.state_db_path)?);
        let exit_wal = Arc::new(ExitWal::open(&config.exit_wal_path)?);

        let runtime = Arc::new(Runtime::new(DEFAULT_HYPERVISOR_BIN, config.kernel_path.clone()));
        let control_plane = Arc::new(ControlPlaneSupervisor::new(runtime.clone()));

        let overlay = Arc::new(OverlayBackend::new(control_plane.clone()));
        let native = Arc::new(NativeBackend::new());
        let networks = Arc::new(NetworkManager::new(store.clone(), overlay, native, config.network_backend));

        let containers = Arc::new(ContainerManager::new(
            store.clone(),
            exit_wal.clone(),
            networks.clone(),
            runtime.clone(),
            config.kernel_path.clone(),
        ));

        Ok(Self { config, store, exit_wal, runtime, control_plane, networks, containers })
    }

    /// Runs startup reconciliation (§4.9). Must be called once, after
    /// `bootstrap` and before the HTTP router starts accepting requests.
    pub async fn reconcile(&self) -> Result<()> {
        let reconciler = Reconciler::new(
            self.store.clone(),
            self.exit_wal.clone(),
            self.containers.clone(),
            self.networks.clone(),
            self.control_plane.clone(),
        );
        reconciler.run().await?;
        Ok(())
    }

    /// Cooperative shutdown (§5): blocks up to 5 seconds for outstanding
    /// exit monitors before returning.
    pub async fn shutdown(&self) {
        self.containers.shutdown().await;
    }
}
