//! Startup reconciliation
//!
//! Runs once, in strict order, when the daemon starts: replays the
//! exit-code write-ahead log, loads persisted state into the in-memory
//! managers, crash-recovers containers left `running` by an unclean
//! exit, ensures the default `bridge` network and the networking helper
//! VM exist, and applies restart policies (§4.9). This is the only code
//! path that writes "first-run" records (§9) — the helper VM container
//! and the default network are both created here, never by a request
//! handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::container::{ContainerManager, ContainerSpec, HostConfig};
use crate::control_plane::{ControlPlaneSupervisor, HELPER_CONTAINER_NAME};
use crate::error::Result;
use crate::network::NetworkManager;
use crate::store::{ExitWal, RestartPolicy, StateStore};

const HELPER_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const HELPER_IMAGE: &str = "arca/control-plane:latest";

pub struct Reconciler {
    store: Arc<StateStore>,
    exit_wal: Arc<ExitWal>,
    containers: Arc<ContainerManager>,
    networks: Arc<NetworkManager>,
    control_plane: Arc<ControlPlaneSupervisor>,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        exit_wal: Arc<ExitWal>,
        containers: Arc<ContainerManager>,
        networks: Arc<NetworkManager>,
        control_plane: Arc<ControlPlaneSupervisor>,
    ) -> Self {
        Self { store, exit_wal, containers, networks, control_plane }
    }

    /// The full startup sequence, §4.9 steps 2-7. Step 1 (opening the
    /// store and running migrations) happens before a `Reconciler`
    /// exists to construct; there are no migrations in this version.
    pub async fn run(&self) -> Result<()> {
        self.replay_exit_wal().await?;

        self.containers.load_from_store().await?;
        self.containers.mark_stale_running_as_crashed().await?;

        self.networks.init().await?;

        self.ensure_control_plane().await;
        self.networks.reapply_all_bridges().await?;

        self.containers.apply_restart_policies().await?;

        info!("startup reconciliation complete");
        Ok(())
    }

    /// Step 2: for every WAL record whose container doesn't yet have a
    /// durably committed exit code, apply it; then truncate the log.
    /// Handles the race in §3 `ExitWALRecord`: the background monitor
    /// wrote the WAL entry but crashed before the DB commit completed.
    async fn replay_exit_wal(&self) -> Result<()> {
        let records = self.exit_wal.read_all()?;
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            if let Some(container) = self.store.get_container(&record.id).await? {
                if container.exit_code.is_none() {
                    self.store
                        .set_exit_state(&record.id, "exited", Some(record.exit_code), container.stopped_by_user)
                        .await?;
                    warn!(id = %record.id, exit_code = record.exit_code, "recovered exit code from exit-wal");
                }
            }
        }

        self.exit_wal.truncate().await?;
        Ok(())
    }

    /// Step 5/6: ensure the helper VM container exists and is started,
    /// wait (bounded) for `GetHealth`, then idempotently re-apply every
    /// persisted network's bridge. On helper failure the daemon stays in
    /// degraded mode — overlay operations fail `ControlPlaneUnavailable`
    /// until the next reconciliation.
    async fn ensure_control_plane(&self) {
        let id = match self.containers.inspect(HELPER_CONTAINER_NAME) {
            Ok(existing) => existing.id,
            Err(_) => match self.create_control_plane_container().await {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "failed to create control-plane container");
                    return;
                }
            },
        };

        if let Err(e) = self.containers.start(&id).await {
            warn!(error = %e, "failed to start control-plane container");
            return;
        }

        self.control_plane.set_helper_id(id);

        if let Err(e) = self.control_plane.wait_healthy(HELPER_HEALTH_TIMEOUT).await {
            warn!(error = %e, "control plane unavailable after startup; overlay operations will fail until it recovers");
        }
    }

    async fn create_control_plane_container(&self) -> Result<String> {
        let spec = ContainerSpec {
            name: Some(HELPER_CONTAINER_NAME.to_string()),
            image: HELPER_IMAGE.to_string(),
            command: vec![],
            env: vec![],
            labels: HashMap::from([
                ("internal".to_string(), "true".to_string()),
                ("role".to_string(), "control-plane".to_string()),
            ]),
            host: HostConfig {
                restart_policy: RestartPolicy::Always,
                network_mode: "none".to_string(),
                binds: vec!["~/.arca/volumes/control-plane:/var/lib/ovn".to_string()],
            },
            internal: true,
        };
        self.containers.create(spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkBackendKind;
    use crate::control_plane::ControlPlaneSupervisor;
    use crate::network::native::NativeBackend;
    use crate::network::overlay::OverlayBackend;
    use crate::runtime::Runtime;

    async fn fresh_reconciler() -> (Reconciler, Arc<ContainerManager>, Arc<NetworkManager>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let exit_wal = Arc::new(ExitWal::open(dir.path().join("exit-wal.log")).unwrap());
        let runtime = Arc::new(Runtime::new("true", "/boot/vmlinux".into()));
        let control_plane = Arc::new(ControlPlaneSupervisor::new(runtime.clone()));
        let overlay = Arc::new(OverlayBackend::new(control_plane.clone()));
        let native = Arc::new(NativeBackend::new());
        let networks = Arc::new(NetworkManager::new(store.clone(), overlay, native, NetworkBackendKind::Overlay));
        let containers = Arc::new(ContainerManager::new(
            store.clone(),
            exit_wal.clone(),
            networks.clone(),
            runtime.clone(),
            "/boot/vmlinux".into(),
        ));
        let reconciler = Reconciler::new(store, exit_wal, containers.clone(), networks.clone(), control_plane);
        (reconciler, containers, networks)
    }

    #[tokio::test]
    async fn replay_is_a_no_op_on_an_empty_wal() {
        let (reconciler, _containers, _networks) = fresh_reconciler().await;
        reconciler.replay_exit_wal().await.unwrap();
        assert!(reconciler.exit_wal.is_empty().unwrap());
    }

    #[tokio::test]
    async fn default_network_exists_after_init() {
        let (_reconciler, _containers, networks) = fresh_reconciler().await;
        networks.init().await.unwrap();
        let all = networks.list_networks().await.unwrap();
        assert!(all.iter().any(|n| n.name == crate::network::manager::DEFAULT_NETWORK_NAME));
    }
}
