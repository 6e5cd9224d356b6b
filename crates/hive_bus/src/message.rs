//! Wire messages: discovery control tags and the remote event envelope.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discovery control message. Carried as the entire datagram payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Ask every peer in the group to announce itself.
    Find,
    /// "I am here." Adds the sender to the receiver's roster.
    Handshake,
}

impl ControlMessage {
    const FIND_TAG: &'static [u8] = b"FindDevices";
    const HANDSHAKE_TAG: &'static [u8] = b"HandShake";

    /// The literal bytes sent on the wire.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Find => Self::FIND_TAG,
            Self::Handshake => Self::HANDSHAKE_TAG,
        }
    }

    /// Classify a payload. Only an exact match is a control message.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            Self::FIND_TAG => Some(Self::Find),
            Self::HANDSHAKE_TAG => Some(Self::Handshake),
            _ => None,
        }
    }
}

/// Routing selector for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// In-process delivery.
    Native,
    /// Cross-peer delivery over the device bus.
    Remote,
    /// Both.
    All,
}

impl Channel {
    pub fn includes_native(self) -> bool {
        matches!(self, Self::Native | Self::All)
    }

    pub fn includes_remote(self) -> bool {
        matches!(self, Self::Remote | Self::All)
    }
}

/// Execution context a local post is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostThread {
    /// The calling thread, synchronously.
    #[default]
    Posting,
    /// The main context, on its next drain.
    Main,
    /// The background worker.
    Background,
}

/// The unit exchanged between event buses over the remote channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event key.
    pub key: String,
    /// Ordered event parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Envelope {
    pub fn new(key: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            params,
        }
    }
}

/// Passed to every handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHead {
    pub key: String,
    /// `Native` for local posts, `Remote` for events from a peer.
    pub channel: Channel,
    /// Sender of a remote event; `None` for local posts.
    pub origin: Option<SocketAddr>,
}

impl EventHead {
    pub fn native(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            channel: Channel::Native,
            origin: None,
        }
    }

    pub fn remote(key: impl Into<String>, origin: SocketAddr) -> Self {
        Self {
            key: key.into(),
            channel: Channel::Remote,
            origin: Some(origin),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
