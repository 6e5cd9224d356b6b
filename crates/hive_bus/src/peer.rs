//! Peer roster — the endpoints discovered through HANDSHAKE messages.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A known peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub addr: SocketAddr,
    /// When the first HANDSHAKE from this endpoint arrived.
    pub discovered_at: DateTime<Utc>,
    /// Last time any datagram from this endpoint arrived.
    pub last_seen: DateTime<Utc>,
}

/// Insertion-ordered, deduplicated set of peer endpoints.
///
/// Entries are only ever added; nothing expires them.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PeerRoster {
    devices: Vec<DeviceInfo>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `addr` unless already present. Returns `true` if it was new.
    ///
    /// Endpoints compare by their textual form so a v4 address and its
    /// formatting-equivalent never appear twice.
    pub fn insert(&mut self, addr: SocketAddr) -> bool {
        if self.contains(addr) {
            return false;
        }
        let now = Utc::now();
        self.devices.push(DeviceInfo {
            addr,
            discovered_at: now,
            last_seen: now,
        });
        true
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.position(addr).is_some()
    }

    /// Refresh `last_seen` for a known endpoint. Unknown endpoints are ignored.
    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(idx) = self.position(addr) {
            self.devices[idx].last_seen = Utc::now();
        }
    }

    /// Endpoints in discovery order.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.devices.iter().map(|d| d.addr).collect()
    }

    pub fn list_all(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    fn position(&self, addr: SocketAddr) -> Option<usize> {
        let key = addr.to_string();
        self.devices.iter().position(|d| d.addr.to_string() == key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
