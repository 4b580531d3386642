//! JSON-RPC-over-vsock control channel client
//!
//! Every host-VM control surface in this daemon (the per-container init
//! channel on port 9999, the in-VM tap-forwarder on port 5555, and the
//! helper VM's bridge-management API, also on 9999) speaks the same
//! shape: a length-delimited frame carrying a JSON `{method, params}`
//! request and a JSON `{ok, result}` or `{ok: false, error}` response.
//! One client, one in-flight request at a time, matching §5's "single-
//! threaded per connection" rule.

use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::debug;

use crate::error::{DaemonError, Result};

#[derive(Debug, serde::Serialize)]
struct Request<'a, P> {
    method: &'a str,
    params: P,
}

#[derive(Debug, serde::Deserialize)]
struct Envelope<R> {
    ok: bool,
    result: Option<R>,
    error: Option<String>,
}

/// A single-outstanding-RPC connection to a well-known in-VM control port.
pub struct RpcClient {
    addr: VsockAddr,
    conn: Mutex<Option<Framed<VsockStream, LengthDelimitedCodec>>>,
}

impl RpcClient {
    pub fn new(cid: u32, port: u32) -> Self {
        Self { addr: VsockAddr::new(cid, port), conn: Mutex::new(None) }
    }

    async fn connection(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = VsockStream::connect(self.addr)
            .await
            .map_err(|e| DaemonError::ControlPlaneUnavailable.with_context(e))?;
        *guard = Some(Framed::new(stream, LengthDelimitedCodec::new()));
        Ok(())
    }

    /// Issue one RPC call, retrying the TCP-equivalent connect once on a
    /// stale/broken link before surfacing `ControlPlaneUnavailable`.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.connection().await?;

        let payload = serde_json::to_vec(&Request { method, params })
            .map_err(|e| DaemonError::Internal(format!("failed to encode rpc request: {e}")))?;

        let mut guard = self.conn.lock().await;
        let framed = guard.as_mut().expect("connection() populates this");

        debug!(method, "sending control-channel rpc");

        if framed.send(payload.into()).await.is_err() {
            *guard = None;
            return Err(DaemonError::ControlPlaneUnavailable);
        }

        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            _ => {
                *guard = None;
                return Err(DaemonError::ControlPlaneUnavailable);
            }
        };

        let envelope: Envelope<R> = serde_json::from_slice(&frame)
            .map_err(|e| DaemonError::Internal(format!("malformed rpc response: {e}")))?;

        if !envelope.ok {
            return Err(DaemonError::Internal(
                envelope.error.unwrap_or_else(|| "rpc call failed".to_string()),
            ));
        }

        envelope
            .result
            .ok_or_else(|| DaemonError::Internal("rpc response missing result".to_string()))
    }

    pub async fn drop_connection(&self) {
        *self.conn.lock().await = None;
    }
}

impl DaemonError {
    fn with_context(self, e: impl std::fmt::Display) -> Self {
        tracing::warn!(error = %e, "control channel connect failed");
        self
    }
}
