//! Event bus — publish/subscribe over an in-process and a remote channel.
//!
//! Handlers subscribe to string keys on the `Native` table, the `Remote`
//! table, or both. Local posts run `Native` handlers; events that arrive
//! from peers through the [`DeviceBus`] run `Remote` handlers with the
//! sender recorded in the [`EventHead`].

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::BusConfig;
use crate::discovery::DeviceBus;
use crate::dispatcher::Dispatcher;
use crate::error::BusError;
use crate::message::{Channel, Envelope, EventHead, PostThread};
use crate::subscription::{self, EventHandler, SubscriptionTable};

type Table = Arc<RwLock<SubscriptionTable>>;

/// Process-wide event bus. Build one at startup and share it by reference
/// or `Arc`.
pub struct EventBus {
    native: Table,
    remote: Table,
    dispatcher: Dispatcher,
    device_bus: OnceCell<DeviceBus<Envelope>>,
}

impl EventBus {
    /// Create a bus that marshals thread-targeted posts through `dispatcher`.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            native: Arc::new(RwLock::new(SubscriptionTable::new())),
            remote: Arc::new(RwLock::new(SubscriptionTable::new())),
            dispatcher,
            device_bus: OnceCell::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Subscribe `handler` to `key` on the selected table(s).
    ///
    /// Returns `false` if the handler was already registered for `key` on any
    /// selected table; the other table is still updated.
    pub fn register(&self, key: &str, handler: &EventHandler, channel: Channel) -> bool {
        let mut ok = true;
        if channel.includes_remote() {
            ok &= self.remote.write().add(key, handler);
        }
        if channel.includes_native() {
            ok &= self.native.write().add(key, handler);
        }
        ok
    }

    /// Unsubscribe `handler` from `key` on the selected table(s).
    ///
    /// Returns `false` if it was missing from any selected table.
    pub fn unregister(&self, key: &str, handler: &EventHandler, channel: Channel) -> bool {
        let mut ok = true;
        if channel.includes_remote() {
            ok &= self.remote.write().remove(key, handler);
        }
        if channel.includes_native() {
            ok &= self.native.write().remove(key, handler);
        }
        ok
    }

    /// Run the native handlers for `key` on the calling thread, in
    /// registration order. Returns `false` if nothing is subscribed.
    pub fn post(&self, key: &str, params: &[Value]) -> bool {
        post_table(&self.native, &EventHead::native(key), params)
    }

    /// Like [`post`](EventBus::post), but delivered on `thread`.
    ///
    /// For `Main` and `Background` the handlers are looked up when the work
    /// item runs, and the return value only says whether it was queued.
    pub fn post_on(&self, key: &str, thread: PostThread, params: Vec<Value>) -> bool {
        match thread {
            PostThread::Posting => self.post(key, &params),
            PostThread::Main => self.dispatcher.invoke_main(self.deferred_post(key, params)),
            PostThread::Background => self.dispatcher.invoke_async(self.deferred_post(key, params)),
        }
    }

    fn deferred_post(&self, key: &str, params: Vec<Value>) -> impl FnOnce() + Send + use<> {
        let native = Arc::clone(&self.native);
        let head = EventHead::native(key);
        move || {
            post_table(&native, &head, &params);
        }
    }

    /// Post on the selected channel(s). Remote delivery is a fire-and-forget
    /// fan-out to the whole port set.
    ///
    /// Returns `true` if a native handler ran or a datagram was sent.
    pub fn post_channel(&self, key: &str, channel: Channel, params: &[Value]) -> bool {
        let mut delivered = false;
        if channel.includes_native() {
            delivered |= self.post(key, params);
        }
        if channel.includes_remote() {
            delivered |= self.post_remote(key, None, params);
        }
        delivered
    }

    /// Send `key` to one peer, or to every port in the set when `endpoint`
    /// is `None`. Returns `false` if remote events are not enabled or
    /// nothing could be sent.
    pub fn post_remote(&self, key: &str, endpoint: Option<SocketAddr>, params: &[Value]) -> bool {
        let Some(bus) = self.device_bus.get() else {
            debug!("Remote events not enabled, dropping '{key}'");
            return false;
        };
        let envelope = Envelope::new(key, params.to_vec());
        match endpoint {
            Some(addr) => bus.send_to(addr, &envelope),
            None => bus.send(&envelope) > 0,
        }
    }

    /// Start the remote channel on `port`, with the default event port set.
    /// Calling it again is a no-op.
    pub async fn enable_remote_event(&self, port: u16) -> Result<(), BusError> {
        self.enable_remote_with(BusConfig::with_port(port)).await
    }

    /// Start the remote channel with a full config. Only the first successful
    /// call takes effect.
    pub async fn enable_remote_with(&self, config: BusConfig) -> Result<(), BusError> {
        if self.device_bus.initialized() {
            debug!("Remote events already enabled");
            return Ok(());
        }
        let remote = Arc::clone(&self.remote);
        self.device_bus
            .get_or_try_init(|| async move {
                let bus = DeviceBus::<Envelope>::open(&config).await?;
                bus.on_common_msg(Arc::new(move |origin: SocketAddr, envelope: Envelope| {
                    debug!("Remote event '{}' from {origin}", envelope.key);
                    let head = EventHead::remote(envelope.key, origin);
                    post_table(&remote, &head, &envelope.params);
                }));
                info!("Remote events enabled on port {}", bus.local_port());
                Ok::<_, BusError>(bus)
            })
            .await?;
        Ok(())
    }

    pub fn is_remote_enabled(&self) -> bool {
        self.device_bus.initialized()
    }

    /// The device bus behind the remote channel, once enabled.
    pub fn device_bus(&self) -> Option<&DeviceBus<Envelope>> {
        self.device_bus.get()
    }

    /// Known peers, empty until remote events are enabled.
    pub fn devices(&self) -> Vec<SocketAddr> {
        self.device_bus
            .get()
            .map(DeviceBus::devices)
            .unwrap_or_default()
    }

    /// Handlers for `key` on one channel (`All` sums both tables).
    pub fn handler_count(&self, key: &str, channel: Channel) -> usize {
        let mut count = 0;
        if channel.includes_native() {
            count += self.native.read().count(key);
        }
        if channel.includes_remote() {
            count += self.remote.read().count(key);
        }
        count
    }

    pub fn has_handlers(&self, key: &str, channel: Channel) -> bool {
        self.handler_count(key, channel) > 0
    }

    /// Stop the remote channel, if running.
    pub fn close(&self) {
        if let Some(bus) = self.device_bus.get() {
            bus.close();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Dispatcher::default())
    }
}

/// Look up `head.key` in `table` and run its handlers without holding the
/// lock, so a handler may register or unregister.
fn post_table(table: &RwLock<SubscriptionTable>, head: &EventHead, params: &[Value]) -> bool {
    let Some(handlers) = table.read().snapshot(&head.key) else {
        debug!("No handlers for event '{}'", head.key);
        return false;
    };
    subscription::invoke(&handlers, head, params);
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    fn counting(hits: &Arc<AtomicUsize>) -> EventHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_: &EventHead, _: &[Value]| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn failing(_head: &EventHead, _params: &[Value]) {
        panic!("handler failure");
    }

    #[test]
    fn test_register_twice_fails() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = counting(&hits);

        assert!(bus.register("ping", &h, Channel::Native));
        assert!(!bus.register("ping", &h, Channel::Native));
        assert_eq!(bus.handler_count("ping", Channel::Native), 1);
    }

    #[test]
    fn test_register_all_reports_partial_duplicate() {
        let bus = EventBus::default();
        let h = counting(&Arc::new(AtomicUsize::new(0)));

        assert!(bus.register("ping", &h, Channel::Native));
        assert!(!bus.register("ping", &h, Channel::All));
        assert_eq!(bus.handler_count("ping", Channel::Native), 1);
        assert_eq!(bus.handler_count("ping", Channel::Remote), 1);
    }

    #[test]
    fn test_post_runs_on_calling_thread() {
        let bus = EventBus::default();
        let caller = std::thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let seen_h = Arc::clone(&seen);
        let h: EventHandler = Arc::new(move |head: &EventHead, params: &[Value]| {
            *seen_h.lock().unwrap() = Some((std::thread::current().id(), head.clone(), params.to_vec()));
        });

        bus.register("ping", &h, Channel::Native);
        assert!(bus.post("ping", &[json!(1), json!("two")]));

        let (thread, head, params) = seen.lock().unwrap().take().unwrap();
        assert_eq!(thread, caller);
        assert_eq!(head, EventHead::native("ping"));
        assert_eq!(params, vec![json!(1), json!("two")]);
    }

    #[test]
    fn test_post_unknown_key_returns_false() {
        let bus = EventBus::default();
        assert!(!bus.post("nobody", &[]));
        assert!(!bus.post_on("nobody", PostThread::Posting, vec![]));
    }

    #[test]
    fn test_unregister_removes_key() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = counting(&hits);

        bus.register("ping", &h, Channel::Native);
        assert!(bus.unregister("ping", &h, Channel::Native));
        assert!(!bus.has_handlers("ping", Channel::Native));
        assert!(!bus.post("ping", &[]));
        assert!(!bus.unregister("ping", &h, Channel::Native));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_all_needs_both_tables() {
        let bus = EventBus::default();
        let h = counting(&Arc::new(AtomicUsize::new(0)));

        bus.register("ping", &h, Channel::Native);
        assert!(!bus.unregister("ping", &h, Channel::All));
        assert!(!bus.has_handlers("ping", Channel::All));
    }

    #[test]
    fn test_post_survives_panicking_handler() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let failing: EventHandler = Arc::new(failing);

        bus.register("ping", &counting(&hits), Channel::Native);
        bus.register("ping", &failing, Channel::Native);
        bus.register("ping", &counting(&hits), Channel::Native);

        assert!(bus.post("ping", &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_native_post_ignores_remote_table() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.register("ping", &counting(&hits), Channel::Remote);

        assert!(!bus.post("ping", &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let bus = Arc::new(EventBus::default());
        let slot: Arc<Mutex<Option<EventHandler>>> = Arc::new(Mutex::new(None));
        let bus_h = Arc::clone(&bus);
        let slot_h = Arc::clone(&slot);
        let h: EventHandler = Arc::new(move |head: &EventHead, _: &[Value]| {
            if let Some(me) = slot_h.lock().unwrap().take() {
                bus_h.unregister(&head.key, &me, Channel::Native);
            }
        });
        *slot.lock().unwrap() = Some(Arc::clone(&h));

        bus.register("once", &h, Channel::Native);
        assert!(bus.post("once", &[]));
        assert!(!bus.post("once", &[]));
    }

    #[test]
    fn test_post_on_main_waits_for_drain() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.register("tick", &counting(&hits), Channel::Native);

        assert!(bus.post_on("tick", PostThread::Main, vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.dispatcher().drain_main(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_on_background() {
        let bus = EventBus::default();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let h: EventHandler = Arc::new(move |_: &EventHead, params: &[Value]| {
            let _ = tx.lock().unwrap().send(params.to_vec());
        });
        bus.register("work", &h, Channel::Native);

        assert!(bus.post_on("work", PostThread::Background, vec![json!(9)]));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![json!(9)]);
    }

    #[test]
    fn test_remote_post_without_remote_enabled() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.register("ping", &counting(&hits), Channel::Native);

        assert!(!bus.is_remote_enabled());
        assert!(!bus.post_remote("ping", None, &[]));
        assert!(bus.devices().is_empty());
        // Native half still delivers.
        assert!(bus.post_channel("ping", Channel::All, &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enable_remote_is_idempotent() {
        let bus = EventBus::default();
        let config = BusConfig {
            multicast_group: std::net::Ipv4Addr::LOCALHOST,
            port: 0,
            port_set: crate::config::PortSet::explicit(vec![]),
            hidden: true,
            ..BusConfig::default()
        };
        bus.enable_remote_with(config.clone()).await.unwrap();
        let port = bus.device_bus().unwrap().local_port();

        bus.enable_remote_with(config).await.unwrap();
        assert!(bus.is_remote_enabled());
        assert_eq!(bus.device_bus().unwrap().local_port(), port);
        bus.close();
    }
}
