//! Connectionless datagram endpoint: bind, optionally learn the remote
//! address from the first datagram, frame/deframe with [`crate::wire`], and
//! count everything that can go wrong without ever retrying.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{VoxError, VoxResult};
use crate::wire;

type RecvHandle = Mutex<Option<JoinHandle<()>>>;

/// Scratch buffer size for `recv_from`.
const SCRATCH_LEN: usize = 2048;

/// The three addressing modes this endpoint supports. All three share one
/// implementation; only how the remote address is obtained differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Bind locally, learn the remote address from the first datagram.
    Listener,
    /// Fix the remote address up front, bind an ephemeral local port.
    Initiator,
    /// Bind a known local port, fix a known remote address; no learning.
    Peer,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransportCounters {
    pub sent: u64,
    pub received: u64,
    pub failed_send: u64,
    pub malformed_received: u64,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    mode: TransportMode,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    failed_send: Arc<AtomicU64>,
    malformed_received: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    recv_handle: RecvHandle,
}

impl Transport {
    pub async fn start_listener(local_port: u16) -> VoxResult<Self> {
        let socket = bind(local_port).await?;
        Ok(Self::new(socket, None, TransportMode::Listener))
    }

    pub async fn start_initiator(remote_ip: &str, remote_port: u16) -> VoxResult<Self> {
        let socket = bind(0).await?;
        let remote = resolve(remote_ip, remote_port)?;
        Ok(Self::new(socket, Some(remote), TransportMode::Initiator))
    }

    pub async fn start_peer(remote_ip: &str, local_port: u16, remote_port: u16) -> VoxResult<Self> {
        let socket = bind(local_port).await?;
        let remote = resolve(remote_ip, remote_port)?;
        Ok(Self::new(socket, Some(remote), TransportMode::Peer))
    }

    fn new(socket: UdpSocket, remote: Option<SocketAddr>, mode: TransportMode) -> Self {
        Self {
            socket: Arc::new(socket),
            remote: Arc::new(Mutex::new(remote)),
            mode,
            sent: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
            failed_send: Arc::new(AtomicU64::new(0)),
            malformed_received: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            recv_handle: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn local_addr(&self) -> VoxResult<SocketAddr> {
        self.socket.local_addr().map_err(VoxError::Io)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// Allowed after start; updates the send target.
    pub fn set_remote(&self, ip: &str, port: u16) -> VoxResult<()> {
        let addr = resolve(ip, port)?;
        *self.remote.lock() = Some(addr);
        Ok(())
    }

    /// Spawn the receive loop. `on_datagram` runs on the receive task for
    /// every well-formed datagram with `(seq, payload)`. In listener mode,
    /// every datagram's source address updates the send target, so the
    /// remote side can roam across NAT rebinds within a call.
    pub fn run_receive_loop<F>(&self, mut on_datagram: F)
    where
        F: FnMut(u32, &[u8]) + Send + 'static,
    {
        let socket = self.socket.clone();
        let remote = self.remote.clone();
        let running = self.running.clone();
        let received = self.received.clone();
        let malformed = self.malformed_received.clone();
        let learns_remote = matches!(self.mode, TransportMode::Listener);

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; SCRATCH_LEN];
            while running.load(Ordering::Acquire) {
                let (n, src) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        if running.load(Ordering::Acquire) {
                            warn!("transport recv error: {e}");
                        }
                        break;
                    }
                };
                if learns_remote {
                    *remote.lock() = Some(src);
                }
                match wire::decode(&buf[..n]) {
                    Some((seq, payload)) => {
                        received.fetch_add(1, Ordering::Relaxed);
                        on_datagram(seq, payload);
                    }
                    None => {
                        malformed.fetch_add(1, Ordering::Relaxed);
                        debug!("discarded malformed datagram ({n} bytes) from {src}");
                    }
                }
            }
        });
        *self.recv_handle.lock() = Some(handle);
    }

    /// Serialize and send one datagram. A partial send counts as failure.
    pub async fn send_frame(&self, seq: u32, payload: &[u8]) -> VoxResult<()> {
        let Some(addr) = *self.remote.lock() else {
            self.failed_send.fetch_add(1, Ordering::Relaxed);
            return Err(VoxError::Network("no remote address set".into()));
        };
        let datagram = wire::encode(seq, payload);
        match self.socket.send_to(&datagram, addr).await {
            Ok(n) if n == datagram.len() => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(n) => {
                self.failed_send.fetch_add(1, Ordering::Relaxed);
                Err(VoxError::Network(format!(
                    "partial datagram send: {n}/{} bytes",
                    datagram.len()
                )))
            }
            Err(e) => {
                self.failed_send.fetch_add(1, Ordering::Relaxed);
                Err(VoxError::Io(e))
            }
        }
    }

    pub fn counters(&self) -> TransportCounters {
        TransportCounters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed_send: self.failed_send.load(Ordering::Relaxed),
            malformed_received: self.malformed_received.load(Ordering::Relaxed),
        }
    }

    /// Flip `running` and request cancellation of the receive task without
    /// awaiting its join. `JoinHandle::abort` takes `&self` and cancels the
    /// task at its next await point regardless of whether anything ever
    /// joins it, so this is sufficient to unblock the receive loop from a
    /// synchronous, non-async caller — in particular `Drop for Session`,
    /// which cannot await. Idempotent: safe to call more than once, and
    /// safe to call before `stop`.
    pub fn stop_sync(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_handle.lock().as_ref() {
            handle.abort();
        }
    }

    /// Stop the receive loop and wait for it to actually finish. The
    /// `tokio::net::UdpSocket` has no synchronous close; aborting the
    /// receive task is the portable way to unblock it within the join
    /// budget (see DESIGN.md). Takes `&self` so `Transport` can be shared
    /// (via `Arc`) with the tasks that send through it, without needing
    /// exclusive access to tear down.
    pub async fn stop(&self) {
        self.stop_sync();
        let handle = self.recv_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn bind(port: u16) -> VoxResult<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", port)).await.map_err(VoxError::Io)
}

fn resolve(ip: &str, port: u16) -> VoxResult<SocketAddr> {
    format!("{ip}:{port}")
        .parse()
        .map_err(|_| VoxError::Config(format!("invalid address {ip}:{port}")))
}
