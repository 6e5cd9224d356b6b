//! Bus configuration: multicast group, ports and queue limits.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Reserved multicast groups used by default. Every bus instance that wants
/// to see the others must agree on one of these.
pub const MULTICAST_POOL: [Ipv4Addr; 4] = [
    Ipv4Addr::new(226, 1, 1, 2),
    Ipv4Addr::new(226, 1, 1, 3),
    Ipv4Addr::new(226, 1, 1, 4),
    Ipv4Addr::new(226, 1, 1, 5),
];

/// First port of the remote event range.
pub const EVENT_PORT_BASE: u16 = 5195;

/// Number of ports in the remote event range.
pub const EVENT_PORT_COUNT: u16 = 5;

/// Default size of a single receive buffer, in bytes. One datagram carries
/// one envelope, so this is also the practical envelope ceiling.
pub const DEFAULT_RECV_BUFFER: usize = 9216;

/// Default number of main-context work items run per drain.
pub const DEFAULT_MAIN_BATCH: usize = 5;

/// The ports on which peers of one logical bus may be listening.
///
/// Kept sorted and deduplicated so fan-out order is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u16>", into = "Vec<u16>")]
pub struct PortSet(Vec<u16>);

impl PortSet {
    /// `len` contiguous ports starting at `base`. Ports past `u16::MAX` are
    /// silently dropped.
    pub fn range(base: u16, len: u16) -> Self {
        let ports = (0..len).filter_map(|i| base.checked_add(i)).collect();
        Self::explicit(ports)
    }

    /// An arbitrary set of ports.
    pub fn explicit(mut ports: Vec<u16>) -> Self {
        ports.sort_unstable();
        ports.dedup();
        Self(ports)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.binary_search(&port).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl Default for PortSet {
    fn default() -> Self {
        Self::range(EVENT_PORT_BASE, EVENT_PORT_COUNT)
    }
}

impl From<Vec<u16>> for PortSet {
    fn from(ports: Vec<u16>) -> Self {
        Self::explicit(ports)
    }
}

impl From<PortSet> for Vec<u16> {
    fn from(set: PortSet) -> Self {
        set.0
    }
}

/// Configuration for a transport / discovery instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Group to join and fan out to. A non-multicast address is used as a
    /// plain unicast target and no group is joined.
    pub multicast_group: Ipv4Addr,

    /// Local receive port.
    pub port: u16,

    /// Ports on which peers of this bus may listen.
    pub port_set: PortSet,

    /// Skip the HANDSHAKE broadcast on startup.
    pub hidden: bool,

    /// Size of the receive buffer for one datagram.
    pub recv_buffer_size: usize,

    /// Upper bound on queued outbound datagrams. `None` means unbounded;
    /// when set, the oldest queued datagram is dropped to make room.
    pub send_queue_limit: Option<usize>,

    /// Main-context work items run per drain.
    pub main_batch_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            multicast_group: MULTICAST_POOL[0],
            port: EVENT_PORT_BASE,
            port_set: PortSet::default(),
            hidden: false,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            send_queue_limit: None,
            main_batch_size: DEFAULT_MAIN_BATCH,
        }
    }
}

impl BusConfig {
    /// Default config listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<BusConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt bus config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read bus config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
