//! Per-attachment frame relay
//!
//! Forwards length-prefixed Ethernet frames between a container-side
//! vsock stream and a helper-VM-side vsock stream. Two independent
//! tasks, one per direction, each with strict per-direction FIFO order
//! and no ordering guarantee across directions (§4.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_vsock::VsockStream;
use tracing::{debug, warn};

const TIGHT_LOOP_CAP: u32 = 64;

/// Host-side vsock ports for the overlay data plane start here.
pub const PORT_RANGE_START: u32 = 20000;
pub const HELPER_PORT_OFFSET: u32 = 10000;

/// Hands out host-side vsock ports for new attachments and reclaims
/// them on detach (§3 invariant: "host-side vsock port unique across
/// the host process").
pub struct PortAllocator {
    next: AtomicU32,
    free: Mutex<Vec<u32>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(PORT_RANGE_START), free: Mutex::new(Vec::new()) }
    }

    /// Returns `(container_side_port, helper_side_port)`.
    pub fn allocate(&self) -> (u32, u32) {
        let port = match self.free.lock().pop() {
            Some(port) => port,
            None => self.next.fetch_add(1, Ordering::SeqCst),
        };
        (port, port + HELPER_PORT_OFFSET)
    }

    /// Returns the container-side port of a pair to the free pool.
    pub fn release(&self, container_side_port: u32) {
        self.free.lock().push(container_side_port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A running relay for one attachment. Dropping or cancelling the token
/// tears both directions down; no FD is leaked into the parent scope.
pub struct FrameRelay {
    cancel: CancellationToken,
    to_helper: JoinHandle<()>,
    to_container: JoinHandle<()>,
}

impl FrameRelay {
    pub fn spawn(container_stream: VsockStream, helper_stream: VsockStream) -> Self {
        let cancel = CancellationToken::new();

        let container_framed = Framed::new(container_stream, LengthDelimitedCodec::new());
        let helper_framed = Framed::new(helper_stream, LengthDelimitedCodec::new());

        let (container_tx, container_rx) = container_framed.split();
        let (helper_tx, helper_rx) = helper_framed.split();

        let to_helper = tokio::spawn(pump("container->helper", container_rx, helper_tx, cancel.clone()));
        let to_container = tokio::spawn(pump("helper->container", helper_rx, container_tx, cancel.clone()));

        Self { cancel, to_helper, to_container }
    }

    /// Signal termination and wait for both directions to drain and
    /// close their file descriptors.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.to_helper.await;
        let _ = self.to_container.await;
    }
}

async fn pump<R, W>(
    direction: &'static str,
    mut rx: futures_util::stream::SplitStream<Framed<R, LengthDelimitedCodec>>,
    mut tx: futures_util::stream::SplitSink<Framed<W, LengthDelimitedCodec>, bytes::Bytes>,
    cancel: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut iterations_since_yield: u32 = 0;
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.next() => frame,
        };

        let Some(frame) = frame else {
            debug!(direction, "relay peer closed, terminating both directions");
            break;
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(direction, error = %e, "relay read error, terminating both directions");
                break;
            }
        };

        match tx.send(frame.freeze()).await {
            Ok(()) => {
                last_activity = tokio::time::Instant::now();
            }
            Err(e) => {
                warn!(direction, error = %e, "relay write error, terminating both directions");
                break;
            }
        }

        iterations_since_yield += 1;
        if iterations_since_yield >= TIGHT_LOOP_CAP {
            iterations_since_yield = 0;
            let idle_for = tokio::time::Instant::now().duration_since(last_activity);
            let backoff = if idle_for < Duration::from_millis(10) {
                Duration::from_micros(100)
            } else {
                Duration::from_millis(1)
            };
            tokio::time::sleep(backoff).await;
        }
    }

    cancel.cancel();
    let _ = tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocator_pairs_offset_by_10000() {
        let allocator = PortAllocator::new();
        let (a, b) = allocator.allocate();
        assert_eq!(a, PORT_RANGE_START);
        assert_eq!(b, a + HELPER_PORT_OFFSET);

        let (c, _) = allocator.allocate();
        assert_eq!(c, a + 1);
    }

    #[test]
    fn released_ports_are_reused_before_advancing() {
        let allocator = PortAllocator::new();
        let (a, _) = allocator.allocate();
        let (b, _) = allocator.allocate();
        allocator.release(a);

        let (c, _) = allocator.allocate();
        assert_eq!(c, a);

        let (d, _) = allocator.allocate();
        assert_eq!(d, b + 1);
    }
}
