//! Bus error types.

use std::net::Ipv4Addr;

/// Errors raised while setting up the bus.
///
/// Public sends, posts and queue drains are best-effort: they log these and
/// report failure as `false`.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The receive port could not be bound.
    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Joining the multicast group failed.
    #[error("Failed to join multicast group {group}: {source}")]
    Multicast {
        group: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport was already closed.
    #[error("Transport closed")]
    Closed,

    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
