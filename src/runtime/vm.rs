//! VM process lifecycle and the per-VM control/forwarder clients

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::runtime::control::RpcClient;

const INIT_CONTROL_PORT: u32 = 9999;
const TAP_FORWARDER_PORT: u32 = 5555;

#[derive(serde::Serialize)]
struct ExecParams<'a> {
    argv: &'a [String],
    env: &'a [String],
}

#[derive(serde::Deserialize)]
struct ExecResult {
    vsock_port: u32,
}

/// What the VM was booted with; kept so a restart-recreate after a
/// daemon restart reproduces the same guest exactly.
#[derive(Debug, Clone)]
pub struct VmBootSpec {
    pub id: String,
    pub kernel_path: PathBuf,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub command: Vec<String>,
    pub env: Vec<String>,
}

/// A live VM: its hypervisor process plus lazily-dialed control
/// channels. Mirrors the lazy-client-connection idiom used for guest
/// agents elsewhere in the example pack, generalized to two well-known
/// ports instead of one.
pub struct VmHandle {
    pub id: String,
    pub cid: u32,
    child: Mutex<Option<Child>>,
    init: RpcClient,
    forwarder: RpcClient,
}

impl VmHandle {
    pub(crate) fn new(id: String, cid: u32, child: Child) -> Self {
        Self {
            id,
            cid,
            child: Mutex::new(Some(child)),
            init: RpcClient::new(cid, INIT_CONTROL_PORT),
            forwarder: RpcClient::new(cid, TAP_FORWARDER_PORT),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }

    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn init_channel(&self) -> &RpcClient {
        &self.init
    }

    pub fn tap_forwarder(&self) -> &RpcClient {
        &self.forwarder
    }

    /// Opens a raw (non-RPC) vsock stream to a per-attachment frame port.
    pub async fn dial_vsock(&self, port: u32) -> Result<VsockStream> {
        VsockStream::connect(VsockAddr::new(self.cid, port))
            .await
            .map_err(|e| DaemonError::Internal(format!("vsock dial to cid {} port {port} failed: {e}", self.cid)))
    }

    /// `Exec`: asks the init channel to spawn `argv` with `env` inside
    /// the guest and hand back a dedicated vsock port multiplexed for
    /// this invocation's stdio, then dials it. The returned stream is
    /// the "stream handle" §4.1 describes the operation as returning;
    /// callers read/write it directly rather than going through the
    /// request/response `RpcClient::call` shape used elsewhere.
    pub async fn exec(&self, argv: Vec<String>, env: Vec<String>) -> Result<VsockStream> {
        let result: ExecResult = self.init.call("Exec", ExecParams { argv: &argv, env: &env }).await?;
        self.dial_vsock(result.vsock_port).await
    }

    /// Graceful stop: ask the init channel to shut down, wait up to
    /// `timeout`, then SIGKILL the hypervisor process.
    pub async fn stop(&self, timeout: Duration) -> Result<i32> {
        let _: Result<serde_json::Value> = self.init.call("Shutdown", serde_json::json!({})).await;

        let waited = tokio::time::timeout(timeout, self.wait_exit()).await;
        match waited {
            Ok(code) => code,
            Err(_) => {
                warn!(id = %self.id, "graceful stop timed out, escalating to SIGKILL");
                self.kill(libc::SIGKILL)?;
                self.wait_exit().await
            }
        }
    }

    pub fn kill(&self, signal: i32) -> Result<()> {
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            if let Some(pid) = child.id() {
                let ret = unsafe { libc::kill(pid as i32, signal) };
                if ret != 0 {
                    return Err(DaemonError::Internal(std::io::Error::last_os_error().to_string()));
                }
            }
        }
        Ok(())
    }

    /// Awaits process exit and returns the guest's reported exit code.
    pub async fn wait_exit(&self) -> Result<i32> {
        let mut child = {
            let mut guard = self.child.lock();
            guard.take()
        };

        let Some(mut child) = child.take() else {
            return Ok(0);
        };

        let status = child
            .wait()
            .await
            .map_err(|e| DaemonError::Internal(format!("failed to await VM process: {e}")))?;

        Ok(status.code().unwrap_or(137))
    }
}

/// Spawns the hypervisor process that backs one VM.
///
/// The concrete hypervisor binary and its vsock wiring are environmental
/// (§9: "the core makes no assumptions beyond the runtime can boot a
/// Linux VM ... and expose a byte-stream control channel"); this spawns
/// whatever binary the deployment configures and assigns it a unique
/// vsock CID.
pub(crate) async fn spawn(hypervisor_bin: &str, cid: u32, spec: &VmBootSpec) -> Result<Child> {
    info!(id = %spec.id, cid, "booting container VM");

    let child = Command::new(hypervisor_bin)
        .arg("--kernel")
        .arg(&spec.kernel_path)
        .arg("--cid")
        .arg(cid.to_string())
        .arg("--vcpus")
        .arg(spec.vcpus.to_string())
        .arg("--memory-mb")
        .arg(spec.memory_mb.to_string())
        .arg("--cmdline")
        .arg(shell_words::join(&spec.command))
        .envs(spec.env.iter().filter_map(|kv| kv.split_once('=')))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| DaemonError::Internal(format!("failed to spawn hypervisor process: {e}")))?;

    Ok(child)
}
