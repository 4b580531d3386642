//! Authoritative container state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::container::model::{Caller, Container, ContainerSpec, Phase};
use crate::container::mounts;
use crate::container::state::{ContainerFlags, Locker};
use crate::container::monitor;
use crate::error::{DaemonError, Result};
use crate::id::IDRegistry;
use crate::network::{ConnectOptions, NetworkManager};
use crate::runtime::{VmBootSpec, VmHandle};
use crate::store::{ContainerRecord, ExitWal, StateStore};

const GRACEFUL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ON_FAILURE_RETRIES: i64 = 5;

/// Events published on container state transitions. Generalizes the
/// teacher's single-server `EventBus` to a shared bus keyed implicitly
/// by the container id carried in each event.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    PhaseChanged { id: String, phase: Phase },
    Exited { id: String, exit_code: i32 },
}

/// State shared between `ContainerManager` and its background exit
/// monitors; kept separate so monitor tasks don't need a reference back
/// into `ContainerManager` itself.
pub(crate) struct Shared {
    pub store: Arc<StateStore>,
    pub exit_wal: Arc<ExitWal>,
    pub networks: Arc<NetworkManager>,
    pub runtime: Arc<crate::runtime::Runtime>,
    pub events: broadcast::Sender<ContainerEvent>,
    pub names: DashMap<String, String>,
}

pub(crate) struct Entry {
    pub(crate) container: RwLock<Container>,
    pub(crate) locker: Locker,
    pub(crate) flags: ContainerFlags,
}

impl Shared {
    /// Pushes a DNS topology update to every other container sharing a
    /// network with `id`, omitting `id` itself (§4.6: "Before Stop /
    /// Remove: push updates removing the departing container from its
    /// peers' views"). Reused by both `ContainerManager::stop` and the
    /// background exit monitor, since a spontaneous exit needs the same
    /// peer fan-out as a user-initiated stop.
    pub(crate) async fn push_topology_to_peers(&self, id: &str) {
        let Ok(attachments) = self.networks.networks_of(id).await else { return };
        for attachment in attachments {
            let Ok(peers) = self.networks.peers_of(id, &attachment.network_id).await else { continue };
            for peer_id in peers {
                if let Some(peer_vm) = self.runtime.get(&peer_id) {
                    if let Ok(snapshot) = self.networks.dns_snapshot_for(&peer_id, &self.names).await {
                        crate::network::dns::push_topology(&peer_vm, &snapshot).await;
                    }
                }
            }
        }
    }
}

pub struct ContainerManager {
    shared: Arc<Shared>,
    ids: IDRegistry,
    containers: DashMap<String, Arc<Entry>>,
    monitors: DashMap<String, JoinHandle<()>>,
    kernel_path: std::path::PathBuf,
}

impl ContainerManager {
    pub fn new(
        store: Arc<StateStore>,
        exit_wal: Arc<ExitWal>,
        networks: Arc<NetworkManager>,
        runtime: Arc<crate::runtime::Runtime>,
        kernel_path: std::path::PathBuf,
    ) -> Self {
        let (events, _rx) = broadcast::channel(4096);
        Self {
            shared: Arc::new(Shared { store, exit_wal, networks, runtime, events, names: DashMap::new() }),
            ids: IDRegistry::new(),
            containers: DashMap::new(),
            monitors: DashMap::new(),
            kernel_path,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.shared.events.subscribe()
    }

    /// Loads every persisted container into memory. Called by the
    /// Reconciler before crash-recovery and restart-policy application.
    pub async fn load_from_store(&self) -> Result<()> {
        let records = self.shared.store.list_containers().await?;
        self.ids.rebuild(records.iter().map(|r| (r.id.clone(), r.name.clone())));

        for record in records {
            self.shared.names.insert(record.id.clone(), record.name.clone());
            let container = Container::from_record(record);
            self.containers.insert(
                container.id.clone(),
                Arc::new(Entry {
                    container: RwLock::new(container),
                    locker: Locker::new(),
                    flags: ContainerFlags::new(),
                }),
            );
        }
        Ok(())
    }

    /// Reconciler step 3: any container found `running` at startup
    /// crashed with the daemon; synthesize its exit.
    pub async fn mark_stale_running_as_crashed(&self) -> Result<()> {
        for entry in self.containers.iter() {
            let id = {
                let mut container = entry.container.write();
                if container.phase != Phase::Running {
                    continue;
                }
                container.phase = Phase::Exited;
                container.exit_code = Some(137);
                container.stopped_by_user = false;
                container.id.clone()
            };
            self.shared.store.set_exit_state(&id, "exited", Some(137), false).await?;
            warn!(id, "container was running at last startup; marked crashed (exit 137)");
        }
        Ok(())
    }

    fn resolve(&self, id_or_name: &str) -> Result<String> {
        let ids: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        self.ids
            .resolve(id_or_name, ids.iter().map(|s| s.as_str()))
            .map_err(|e| match e {
                crate::id::ResolveError::AmbiguousPrefix(p) => DaemonError::AmbiguousPrefix(p),
                crate::id::ResolveError::TooShort(r) => {
                    DaemonError::InvalidArgument(format!("reference too short to resolve: {r}"))
                }
                crate::id::ResolveError::NotFound(_) => DaemonError::not_found("container", id_or_name),
            })
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        self.containers.get(id).map(|e| e.clone()).ok_or_else(|| DaemonError::not_found("container", id))
    }

    pub fn inspect(&self, id_or_name: &str) -> Result<Container> {
        let id = self.resolve(id_or_name)?;
        Ok(self.entry(&id)?.container.read().clone())
    }

    /// List containers; hides `internal=true` unless `include_internal`.
    pub fn list(&self, include_internal: bool) -> Vec<Container> {
        self.containers
            .iter()
            .map(|e| e.container.read().clone())
            .filter(|c| include_internal || !c.internal)
            .collect()
    }

    pub async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let name = spec.name.clone().unwrap_or_else(|| format!("arca-{}", &IDRegistry::generate_id()[..8]));
        if self.ids.name_taken(&name) {
            return Err(DaemonError::NameConflict(name));
        }

        let binds = mounts::compose(&spec.host.binds)?;
        let id = IDRegistry::generate_id();

        // `spec.image` is taken on faith: image pull/storage is an external
        // collaborator out of scope here, so there's no ImageNotFound check.
        let container = Container {
            id: id.clone(),
            name: name.clone(),
            image: spec.image,
            command: spec.command,
            env: spec.env,
            labels: spec.labels,
            restart_policy: spec.host.restart_policy,
            network_mode: spec.host.network_mode,
            binds: binds.iter().map(|b| format!("{}:{}{}", b.source.display(), b.destination, if b.read_only { ":ro" } else { "" })).collect(),
            phase: Phase::Created,
            exit_code: None,
            stopped_by_user: false,
            restart_retry_count: 0,
            internal: spec.internal,
            created_at: now_secs(),
        };

        self.shared.store.save_container(&container.to_record()).await?;
        self.ids.register(&id, &name);
        self.shared.names.insert(id.clone(), name);
        self.containers.insert(
            id.clone(),
            Arc::new(Entry { container: RwLock::new(container), locker: Locker::new(), flags: ContainerFlags::new() }),
        );

        Ok(id)
    }

    pub async fn start(&self, id_or_name: &str) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let entry = self.entry(&id)?;
        let _guard = entry.locker.acquire().await.map_err(|_| DaemonError::Internal("power lock unavailable".into()))?;

        {
            let container = entry.container.read();
            if container.phase == Phase::Running {
                return Ok(());
            }
        }

        let vm = if let Some(vm) = self.shared.runtime.get(&id).filter(|vm| vm.is_alive()) {
            vm.kill(0).ok();
            vm
        } else {
            self.shared.runtime.remove(&id).await?;
            let (image, command, env) = {
                let c = entry.container.read();
                (c.image.clone(), c.command.clone(), c.env.clone())
            };
            let _ = image;
            self.shared
                .runtime
                .create(VmBootSpec {
                    id: id.clone(),
                    kernel_path: self.kernel_path.clone(),
                    vcpus: 1,
                    memory_mb: 256,
                    command,
                    env,
                })
                .await?
        };

        self.shared.store.set_phase(&id, "running").await?;
        {
            let mut container = entry.container.write();
            container.phase = Phase::Running;
        }
        let _ = self.shared.events.send(ContainerEvent::PhaseChanged { id: id.clone(), phase: Phase::Running });

        self.auto_attach_networks(&id, &entry, vm.clone()).await?;
        self.push_dns_topology(&id, &vm).await;

        let handle = tokio::spawn(monitor::run(self.shared.clone(), entry.clone(), id.clone(), vm));
        self.monitors.insert(id, handle);

        Ok(())
    }

    async fn auto_attach_networks(&self, id: &str, entry: &Entry, vm: Arc<VmHandle>) -> Result<()> {
        let existing = self.shared.networks.networks_of(id).await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let network_mode = entry.container.read().network_mode.clone();
        let target = match network_mode.as_str() {
            "none" => return Ok(()),
            "default" | "bridge" => crate::network::manager::DEFAULT_NETWORK_NAME,
            other => other,
        };

        self.shared
            .networks
            .connect(id, target, &[], ConnectOptions::default(), vm)
            .await?;
        Ok(())
    }

    async fn push_dns_topology(&self, id: &str, vm: &Arc<VmHandle>) {
        if let Ok(snapshot) = self.shared.networks.dns_snapshot_for(id, &self.shared.names).await {
            crate::network::dns::push_topology(vm, &snapshot).await;
        }

        if let Ok(attachments) = self.shared.networks.networks_of(id).await {
            for attachment in attachments {
                if let Ok(peers) = self.shared.networks.peers_of(id, &attachment.network_id).await {
                    for peer_id in peers {
                        if let Some(peer_vm) = self.shared.runtime.get(&peer_id) {
                            if let Ok(snapshot) = self.shared.networks.dns_snapshot_for(&peer_id, &self.shared.names).await {
                                crate::network::dns::push_topology(&peer_vm, &snapshot).await;
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn stop(&self, id_or_name: &str, timeout: Option<Duration>, caller: Caller) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let entry = self.entry(&id)?;
        let _guard = entry.locker.acquire().await.map_err(|_| DaemonError::Internal("power lock unavailable".into()))?;

        {
            let container = entry.container.read();
            if container.internal && caller != Caller::Reconciler {
                return Err(DaemonError::OperationNotPermitted(
                    "reserved containers may only be stopped by the daemon".to_string(),
                ));
            }
            if container.phase != Phase::Running {
                return Err(DaemonError::InvalidState(format!("container {id} is not running")));
            }
        }

        let vm = self.shared.runtime.get(&id).ok_or_else(|| crate::runtime::not_running(&id))?;

        self.shared.push_topology_to_peers(&id).await;

        let exit_code = vm.stop(timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)).await?;

        if let Some(handle) = self.monitors.remove(&id) {
            handle.1.abort();
        }

        self.shared.store.set_exit_state(&id, "exited", Some(exit_code), true).await?;
        {
            let mut container = entry.container.write();
            container.phase = Phase::Exited;
            container.exit_code = Some(exit_code);
            container.stopped_by_user = true;
        }
        let _ = self.shared.events.send(ContainerEvent::Exited { id, exit_code });

        Ok(())
    }

    pub async fn kill(&self, id_or_name: &str, signal: i32) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let entry = self.entry(&id)?;

        {
            let container = entry.container.read();
            if container.phase != Phase::Running {
                return Err(DaemonError::InvalidState(format!("container {id} is not running")));
            }
        }

        let vm = self.shared.runtime.get(&id).ok_or_else(|| crate::runtime::not_running(&id))?;
        vm.kill(signal)?;
        Ok(())
    }

    /// `remove_volumes` mirrors Docker's `-v` flag; this daemon only
    /// composes bind mounts (§4.1), so there is no named-volume store to
    /// clean up yet and the flag is currently accepted for wire
    /// compatibility without effect.
    pub async fn remove(&self, id_or_name: &str, force: bool, _remove_volumes: bool, caller: Caller) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let entry = self.entry(&id)?;

        {
            let container = entry.container.read();
            if container.internal && caller != Caller::Reconciler {
                return Err(DaemonError::OperationNotPermitted(
                    "reserved containers may only be removed by the daemon".to_string(),
                ));
            }
            if container.phase == Phase::Running && !force {
                return Err(DaemonError::Conflict(format!("container {id} is running; use force to remove")));
            }
        }

        if !entry.flags.try_start_removing() {
            return Err(DaemonError::Conflict(format!("container {id} is already being removed")));
        }

        if entry.container.read().phase == Phase::Running {
            self.stop(&id, Some(Duration::from_secs(0)), caller).await.ok();
        }

        if let Some(handle) = self.monitors.remove(&id) {
            handle.1.abort();
        }

        self.shared.runtime.remove(&id).await?;
        self.shared.store.delete_container(&id).await?;
        let name = entry.container.read().name.clone();
        self.ids.unregister_name(&name);
        self.shared.names.remove(&id);
        self.containers.remove(&id);

        Ok(())
    }

    pub async fn attach_network(&self, id_or_name: &str, network_ref: &str, opts: ConnectOptions) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let vm = self.shared.runtime.get(&id).ok_or_else(|| crate::runtime::not_running(&id))?;
        let existing = self.shared.networks.networks_of(&id).await?;
        let devices: Vec<String> = existing.iter().map(|a| a.device_name.clone()).collect();
        self.shared.networks.connect(&id, network_ref, &devices, opts, vm.clone()).await?;
        self.push_dns_topology(&id, &vm).await;
        Ok(())
    }

    pub async fn detach_network(&self, id_or_name: &str, network_ref: &str, force: bool) -> Result<()> {
        let id = self.resolve(id_or_name)?;
        let vm = self.shared.runtime.get(&id);
        self.shared.networks.disconnect(&id, network_ref, force, vm.clone()).await?;
        if let Some(vm) = vm {
            self.push_dns_topology(&id, &vm).await;
        }
        Ok(())
    }

    /// `Exec(idOrName, argv, env)`: delegates to the runtime, returning a
    /// stream handle for the invocation's multiplexed stdio (§4.1).
    pub async fn exec(
        &self,
        id_or_name: &str,
        argv: Vec<String>,
        env: Vec<String>,
    ) -> Result<tokio_vsock::VsockStream> {
        let id = self.resolve(id_or_name)?;
        let vm = self.shared.runtime.get(&id).ok_or_else(|| crate::runtime::not_running(&id))?;
        vm.exec(argv, env).await
    }

    /// Blocks until the container's phase is `exited`, returning its
    /// exit code.
    pub async fn wait(&self, id_or_name: &str) -> Result<i32> {
        let id = self.resolve(id_or_name)?;
        let mut rx = self.subscribe();
        loop {
            {
                let entry = self.entry(&id)?;
                let container = entry.container.read();
                if container.phase == Phase::Exited {
                    return Ok(container.exit_code.unwrap_or(0));
                }
            }
            match rx.recv().await {
                Ok(ContainerEvent::Exited { id: eid, exit_code }) if eid == id => return Ok(exit_code),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DaemonError::Internal("event bus closed".to_string()))
                }
            }
        }
    }

    /// Applies restart policies via the store's `containers_to_restart`
    /// query (Reconciler step 7).
    pub async fn apply_restart_policies(&self) -> Result<()> {
        let candidates = self.shared.store.containers_to_restart(MAX_ON_FAILURE_RETRIES).await?;
        for record in candidates {
            info!(id = %record.id, name = %record.name, "restarting container per restart policy");
            if record.restart_policy == crate::store::RestartPolicy::OnFailure {
                self.shared.store.bump_restart_retry(&record.id).await?;
            }
            if let Err(e) = self.start(&record.id).await {
                warn!(id = %record.id, error = %e, "restart policy application failed");
            }
        }
        Ok(())
    }

    /// Blocks up to [`GRACEFUL_SHUTDOWN_BUDGET`] for outstanding exit
    /// monitors, then returns regardless.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.monitors.iter().map(|e| e.key().clone()).collect::<Vec<_>>().into_iter().filter_map(|k| self.monitors.remove(&k).map(|(_, h)| h)).collect();
        let joined = futures_util::future::join_all(handles);
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_BUDGET, joined).await;
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
