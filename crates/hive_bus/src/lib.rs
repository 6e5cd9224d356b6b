//! Hive Bus — LAN peer discovery, typed events and cross-context dispatch.
//!
//! This crate lets independently running processes on the same network find
//! each other and exchange events, and lets one process move work between a
//! background worker and a designated main context.
//!
//! # Architecture
//!
//! - **Transport**: one UDP socket, optionally joined to a multicast group,
//!   with a receive loop and a queued send loop.
//! - **Discovery**: `FindDevices` / `HandShake` control messages build a
//!   roster of peer endpoints; everything else is a JSON application payload.
//! - **Event bus**: string-keyed publish/subscribe with a `Native`
//!   (in-process) and a `Remote` (via discovery) channel.
//! - **Dispatcher**: a batched main-context queue and an on-demand
//!   background worker.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hive_bus::{Channel, Dispatcher, EventBus, EventHandler, EventHead};
//!
//! # async fn example() {
//! let bus = EventBus::new(Dispatcher::default());
//! let on_ping: EventHandler = Arc::new(|head: &EventHead, params: &[serde_json::Value]| {
//!     println!("{} from {:?}: {params:?}", head.key, head.origin);
//! });
//!
//! bus.register("ping", &on_ping, Channel::All);
//! bus.enable_remote_event(5195).await.unwrap();
//! bus.post_channel("ping", Channel::All, &[serde_json::json!(1)]);
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod host;
pub mod logging;
pub mod message;
pub mod peer;
pub mod subscription;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{BusConfig, MULTICAST_POOL, PortSet};
pub use discovery::DeviceBus;
pub use dispatcher::Dispatcher;
pub use error::BusError;
pub use event_bus::EventBus;
pub use message::{Channel, ControlMessage, Envelope, EventHead, PostThread};
pub use peer::{DeviceInfo, PeerRoster};
pub use subscription::EventHandler;
pub use transport::{Datagram, Transport};
