//! Peer discovery and typed messaging over a [`Transport`].
//!
//! [`DeviceBus`] speaks a two-message discovery protocol on top of the raw
//! UDP transport:
//!
//! - `FindDevices`: "who is out there?" Every peer that hears it answers
//!   with its own HANDSHAKE.
//! - `HandShake`: "I am here." The receiver adds the sender's endpoint to
//!   its roster.
//!
//! Every other payload is a JSON-encoded application value of type `T`,
//! delivered to the `on_common_msg` callbacks. Datagrams that loop back from
//! our own socket are dropped before any of this.

use std::io;
use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, trace, warn};

use crate::config::{BusConfig, PortSet};
use crate::error::BusError;
use crate::host;
use crate::message::ControlMessage;
use crate::peer::{DeviceInfo, PeerRoster};
use crate::transport::{Datagram, Transport};

/// Fired once per newly discovered endpoint.
pub type NewDeviceCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Fired for every decoded application message from a peer.
pub type CommonMsgCallback<T> = Arc<dyn Fn(SocketAddr, T) + Send + Sync>;

/// A typed, peer-aware bus over one UDP transport.
pub struct DeviceBus<T> {
    inner: Arc<DeviceInner<T>>,
}

impl<T> Clone for DeviceBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DeviceInner<T> {
    transport: Transport,
    /// Multicast group, or a unicast host when no group is joined.
    target: Ipv4Addr,
    port_set: PortSet,
    local_addrs: Vec<Ipv4Addr>,
    roster: RwLock<PeerRoster>,
    online: AtomicBool,
    on_new_device: RwLock<Vec<NewDeviceCallback>>,
    on_common_msg: RwLock<Vec<CommonMsgCallback<T>>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DeviceBus<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Bind `config.port`, join `config.multicast_group` and, unless
    /// `config.hidden`, announce ourselves to every port in the port set.
    pub async fn open(config: &BusConfig) -> Result<Self, BusError> {
        let transport = Transport::open_with(
            config.port,
            Some(config.multicast_group),
            config.recv_buffer_size,
            config.send_queue_limit,
        )
        .await?;

        // Hostname resolution may block.
        let group = config.multicast_group;
        let local_addrs = tokio::task::spawn_blocking(move || host::local_ipv4_addrs(group))
            .await
            .unwrap_or_else(|e| {
                warn!("Local address lookup failed, only loopback is filtered: {e}");
                vec![Ipv4Addr::LOCALHOST]
            });
        debug!("Self-filter addresses: {local_addrs:?}");

        let inner = Arc::new(DeviceInner {
            transport,
            target: config.multicast_group,
            port_set: config.port_set.clone(),
            local_addrs,
            roster: RwLock::new(PeerRoster::new()),
            online: AtomicBool::new(false),
            on_new_device: RwLock::new(Vec::new()),
            on_common_msg: RwLock::new(Vec::new()),
            _payload: PhantomData,
        });

        let weak: Weak<DeviceInner<T>> = Arc::downgrade(&inner);
        inner.transport.listen(Arc::new(move |datagram: &Datagram| {
            if let Some(inner) = weak.upgrade() {
                inner.on_data(datagram);
            }
        }));

        if !config.hidden {
            inner.broadcast_control(ControlMessage::Handshake);
        }

        info!(
            "Device bus on port {} (target {}, ports {:?}, hidden: {})",
            inner.transport.local_port(),
            inner.target,
            inner.port_set.iter().collect::<Vec<_>>(),
            config.hidden
        );
        Ok(Self { inner })
    }

    /// Open on `port` with the contiguous port set `base..base + len` and
    /// otherwise default settings.
    pub async fn open_range(port: u16, base: u16, len: u16, hidden: bool) -> Result<Self, BusError> {
        let config = BusConfig {
            port,
            port_set: PortSet::range(base, len),
            hidden,
            ..BusConfig::default()
        };
        Self::open(&config).await
    }

    /// Ask every peer in the group to announce itself. Returns the number of
    /// datagrams handed to the socket.
    pub fn find_devices(&self) -> usize {
        self.inner.broadcast_control(ControlMessage::Find)
    }

    /// Broadcast our own HANDSHAKE again.
    pub fn announce(&self) -> usize {
        self.inner.broadcast_control(ControlMessage::Handshake)
    }

    /// Fan `value` out to every port in the port set.
    pub fn send(&self, value: &T) -> usize {
        match encode(value) {
            Ok(bytes) => self.inner.broadcast(&bytes),
            Err(e) => {
                warn!("Failed to encode device bus message: {e}");
                0
            }
        }
    }

    /// Unicast `value` to a single endpoint.
    pub fn send_to(&self, addr: SocketAddr, value: &T) -> bool {
        match encode(value) {
            Ok(bytes) => self.inner.send_bytes(addr, &bytes),
            Err(e) => {
                warn!("Failed to encode device bus message for {addr}: {e}");
                false
            }
        }
    }

    pub fn on_new_device(&self, callback: NewDeviceCallback) -> &Self {
        self.inner.on_new_device.write().push(callback);
        self
    }

    pub fn on_common_msg(&self, callback: CommonMsgCallback<T>) -> &Self {
        self.inner.on_common_msg.write().push(callback);
        self
    }

    /// Snapshot of known peer endpoints, in discovery order.
    pub fn devices(&self) -> Vec<SocketAddr> {
        self.inner.roster.read().endpoints()
    }

    /// Snapshot of known peers with their timestamps.
    pub fn device_info(&self) -> Vec<DeviceInfo> {
        self.inner.roster.read().list_all().to_vec()
    }

    /// Set once we have heard a FIND or a new HANDSHAKE from a peer.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> u16 {
        self.inner.transport.local_port()
    }

    /// The joined multicast group, or `None` when fanning out over unicast.
    pub fn multicast_group(&self) -> Option<Ipv4Addr> {
        self.inner.transport.multicast_group()
    }

    pub fn port_set(&self) -> &PortSet {
        &self.inner.port_set
    }

    /// Stop the transport and forget peers and callbacks.
    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.roster.write().clear();
        self.inner.on_new_device.write().clear();
        self.inner.on_common_msg.write().clear();
        self.inner.online.store(false, Ordering::SeqCst);
    }
}

impl<T> DeviceInner<T>
where
    T: DeserializeOwned + Clone,
{
    fn on_data(&self, datagram: &Datagram) {
        let src = datagram.addr;
        if host::is_self(src, &self.local_addrs, self.transport.local_port()) {
            trace!("Filtered own datagram from {src}");
            return;
        }

        match ControlMessage::parse(&datagram.payload) {
            Some(ControlMessage::Find) => {
                debug!("FindDevices from {src}, replying with HandShake");
                self.broadcast_control(ControlMessage::Handshake);
                self.online.store(true, Ordering::SeqCst);
            }
            Some(ControlMessage::Handshake) => {
                if !self.roster.write().insert(src) {
                    debug!("Device already known: {src}");
                    return;
                }
                info!("New device discovered: {src}");
                self.online.store(true, Ordering::SeqCst);
                let callbacks = self.on_new_device.read().clone();
                for callback in callbacks {
                    if catch_unwind(AssertUnwindSafe(|| callback(src))).is_err() {
                        warn!("New-device callback panicked for {src}");
                    }
                }
            }
            None => {
                self.roster.write().touch(src);
                let value = match decode::<T>(&datagram.payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Dropping malformed message from {src}: {e}");
                        return;
                    }
                };
                let callbacks = self.on_common_msg.read().clone();
                for callback in callbacks {
                    let value = value.clone();
                    if catch_unwind(AssertUnwindSafe(|| callback(src, value))).is_err() {
                        warn!("Message callback panicked for datagram from {src}");
                    }
                }
            }
        }
    }
}

impl<T> DeviceInner<T> {
    fn broadcast_control(&self, msg: ControlMessage) -> usize {
        self.broadcast(msg.as_bytes())
    }

    fn broadcast(&self, bytes: &[u8]) -> usize {
        self.port_set
            .iter()
            .filter(|port| self.send_bytes(SocketAddr::from((self.target, *port)), bytes))
            .count()
    }

    /// Immediate send, falling back to the queue when the socket buffer is full.
    fn send_bytes(&self, dst: SocketAddr, bytes: &[u8]) -> bool {
        match self.transport.try_send(dst, bytes) {
            Ok(_) => true,
            Err(BusError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                self.transport.send_queued(dst, bytes)
            }
            Err(e) => {
                warn!("Device bus send to {dst} failed: {e}");
                false
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    Ok(serde_json::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
