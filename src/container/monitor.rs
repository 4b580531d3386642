//! Background exit monitor
//!
//! Spawned once per successful `Start`; awaits the runtime's exit
//! notification for one VM and then, in order, (a) appends an
//! [`ExitWalRecord`](crate::store::ExitWalRecord), (b) commits the exit
//! state to the store, and (c) fans a DNS topology update out to every
//! peer that shared a network with the exited container (§4.1/§4.6).
//! The WAL append happens before the DB commit specifically so a daemon
//! crash between the two is recoverable by [`crate::reconciler`] on the
//! next startup (§3 `ExitWALRecord`, §9 "write-ahead exit log").

use std::sync::Arc;

use tracing::{info, warn};

use crate::container::manager::{ContainerEvent, Entry, Shared};
use crate::container::model::Phase;
use crate::runtime::VmHandle;
use crate::store::ExitWalRecord;

pub(crate) async fn run(shared: Arc<Shared>, entry: Arc<Entry>, id: String, vm: Arc<VmHandle>) {
    let exit_code = match vm.wait_exit().await {
        Ok(code) => code,
        Err(e) => {
            warn!(id, error = %e, "failed to await VM exit; assuming crashed");
            137
        }
    };

    info!(id, exit_code, "container exited");

    let stopped_by_user = entry.container.read().stopped_by_user;

    if let Err(e) = shared
        .exit_wal
        .append(&ExitWalRecord { id: id.clone(), exit_code, timestamp_ns: now_ns() })
        .await
    {
        warn!(id, error = %e, "failed to append exit-wal record");
    }

    if let Err(e) = shared.store.set_exit_state(&id, "exited", Some(exit_code), stopped_by_user).await {
        warn!(id, error = %e, "failed to commit exit state; will be recovered from exit-wal on next startup");
    }

    {
        let mut container = entry.container.write();
        container.phase = Phase::Exited;
        container.exit_code = Some(exit_code);
    }

    shared.push_topology_to_peers(&id).await;

    let _ = shared.events.send(ContainerEvent::Exited { id, exit_code });
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
