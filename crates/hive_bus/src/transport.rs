//! UDP transport — one socket, a receive loop and a queued send loop.
//!
//! [`Transport`] binds a UDP socket on the wildcard address, optionally joins
//! a multicast group, and spawns two background tasks:
//!
//! 1. A receive loop that hands every inbound [`Datagram`] to the registered
//!    listeners, synchronously and in registration order.
//! 2. A send loop that drains the delivery queue fed by
//!    [`Transport::send_queued`].
//!
//! Everything here is best-effort. Send failures are logged and surface as
//! `false`; a panicking listener is logged and the loop keeps receiving.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_RECV_BUFFER;
use crate::error::BusError;

/// A payload and the peer it came from (inbound) or goes to (outbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub addr: SocketAddr,
}

/// Callback invoked on the receive task for each inbound datagram.
pub type DatagramListener = Arc<dyn Fn(&Datagram) + Send + Sync>;

type Listeners = Arc<RwLock<Vec<DatagramListener>>>;

/// Outbound FIFO drained by the send loop.
struct SendQueue {
    items: Mutex<VecDeque<Datagram>>,
    /// `None` is unbounded; otherwise the oldest item is dropped when full.
    limit: Option<usize>,
    notify: Notify,
}

impl SendQueue {
    fn new(limit: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            limit: limit.filter(|l| *l > 0),
            notify: Notify::new(),
        }
    }

    fn push(&self, datagram: Datagram) {
        {
            let mut items = self.items.lock();
            if let Some(limit) = self.limit {
                while items.len() >= limit {
                    if let Some(dropped) = items.pop_front() {
                        debug!("Send queue full, dropping datagram for {}", dropped.addr);
                    }
                }
            }
            items.push_back(datagram);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Datagram> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}

/// A UDP endpoint with background receive and send loops.
///
/// Cheap to clone; all clones share the socket. The loops stop on
/// [`close`](Transport::close) or once every clone is dropped.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

/// The async socket driven by the loops, plus a handle to the same socket
/// for synchronous sends outside the runtime's readiness tracking.
struct Sockets {
    io: Arc<UdpSocket>,
    sync: StdUdpSocket,
}

struct TransportInner {
    sockets: Mutex<Option<Sockets>>,
    local_addr: SocketAddr,
    multicast_group: Option<Ipv4Addr>,
    listeners: Listeners,
    queue: Arc<SendQueue>,
    running: AtomicBool,
    /// Dropping this (with the last handle) also stops both loops.
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Bind `local_port` on the wildcard address and, when `multicast_group`
    /// is a multicast address, join it.
    pub async fn open(
        local_port: u16,
        multicast_group: Option<Ipv4Addr>,
    ) -> Result<Self, BusError> {
        Self::open_with(local_port, multicast_group, DEFAULT_RECV_BUFFER, None).await
    }

    /// [`open`](Transport::open) with an explicit receive buffer size and
    /// delivery queue limit.
    pub async fn open_with(
        local_port: u16,
        multicast_group: Option<Ipv4Addr>,
        recv_buffer_size: usize,
        send_queue_limit: Option<usize>,
    ) -> Result<Self, BusError> {
        let bind_error = |source: io::Error| BusError::Bind {
            port: local_port,
            source,
        };
        let std_socket =
            StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port)).map_err(bind_error)?;
        std_socket.set_nonblocking(true)?;
        let sync = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        let multicast_group = match multicast_group {
            Some(group) if group.is_multicast() => {
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|source| BusError::Multicast { group, source })?;
                socket.set_multicast_loop_v4(true)?;
                Some(group)
            }
            Some(addr) => {
                debug!("{addr} is not a multicast address, using plain unicast");
                None
            }
            None => None,
        };

        let socket = Arc::new(socket);
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let queue = Arc::new(SendQueue::new(send_queue_limit));
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&listeners),
            recv_buffer_size.max(1),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(send_loop(
            Arc::clone(&socket),
            Arc::clone(&queue),
            shutdown_tx.subscribe(),
        ));

        info!("UDP transport listening on {local_addr} (multicast: {multicast_group:?})");

        Ok(Self {
            inner: Arc::new(TransportInner {
                sockets: Mutex::new(Some(Sockets { io: socket, sync })),
                local_addr,
                multicast_group,
                listeners,
                queue,
                running: AtomicBool::new(true),
                shutdown_tx,
            }),
        })
    }

    /// Register a callback for inbound datagrams. Runs on the receive task,
    /// so keep it short and hand heavier work to the dispatcher.
    pub fn listen(&self, listener: DatagramListener) -> &Self {
        self.inner.listeners.write().push(listener);
        self
    }

    /// Send one datagram right away on the calling thread. Failures are
    /// logged, never raised.
    pub fn send_now(&self, dst: SocketAddr, bytes: &[u8]) -> bool {
        match self.try_send(dst, bytes) {
            Ok(_) => true,
            Err(e) => {
                warn!("UDP send to {dst} failed: {e}");
                false
            }
        }
    }

    /// Queue a datagram for the send loop. Returns `false` only when the
    /// transport is closed.
    pub fn send_queued(&self, dst: SocketAddr, bytes: &[u8]) -> bool {
        if !self.is_running() {
            debug!("Transport closed, dropping queued send to {dst}");
            return false;
        }
        self.inner.queue.push(Datagram {
            payload: bytes.to_vec(),
            addr: dst,
        });
        true
    }

    /// Immediate send that reports the raw outcome, so callers can tell a
    /// full socket buffer (`WouldBlock`) apart from a closed transport.
    pub(crate) fn try_send(&self, dst: SocketAddr, bytes: &[u8]) -> Result<usize, BusError> {
        if !self.is_running() {
            return Err(BusError::Closed);
        }
        let sockets = self.inner.sockets.lock();
        let sockets = sockets.as_ref().ok_or(BusError::Closed)?;
        let sent = sockets.sync.send_to(bytes, dst)?;
        trace!("Sent {sent} bytes to {dst}");
        Ok(sent)
    }

    /// Stop both loops, leave the group and release the socket. Safe to call
    /// from any thread and more than once.
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let sockets = self.inner.sockets.lock().take();
        if let (Some(sockets), Some(group)) = (sockets, self.inner.multicast_group) {
            if let Err(e) = sockets.io.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                debug!("Leaving multicast group {group} failed: {e}");
            }
        }
        self.inner.queue.clear();
        let _ = self.inner.shutdown_tx.send(());
        info!("UDP transport on {} closed", self.inner.local_addr);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The bound address (wildcard IP, real port).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// The joined group, if any.
    pub fn multicast_group(&self) -> Option<Ipv4Addr> {
        self.inner.multicast_group
    }

    /// Datagrams waiting in the delivery queue.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    listeners: Listeners,
    buffer_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        let datagram = Datagram {
                            payload: buf[..len].to_vec(),
                            addr,
                        };
                        deliver(&listeners, &datagram);
                    }
                    Err(e) => warn!("UDP recv error: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("UDP receive loop shutting down");
                break;
            }
        }
    }
}

fn deliver(listeners: &Listeners, datagram: &Datagram) {
    // Snapshot so a listener may register another without deadlocking.
    let snapshot: Vec<DatagramListener> = listeners.read().clone();
    for listener in snapshot {
        if catch_unwind(AssertUnwindSafe(|| listener(datagram))).is_err() {
            warn!("Datagram listener panicked on packet from {}", datagram.addr);
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<SendQueue>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        match queue.pop() {
            Some(datagram) => {
                if let Err(e) = socket.send_to(&datagram.payload, datagram.addr).await {
                    warn!("Queued UDP send to {} failed: {e}", datagram.addr);
                }
            }
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = shutdown.recv() => {
                        debug!("UDP send loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
