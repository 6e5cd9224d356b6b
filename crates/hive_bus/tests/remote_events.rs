//! Two buses talking over loopback: discovery, typed messages and remote
//! events. Each test uses its own port pair.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hive_bus::{
    BusConfig, BusError, Channel, DeviceBus, EventBus, EventHandler, EventHead, MULTICAST_POOL,
    PortSet,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: f64,
}

fn loopback_config(port: u16, peers: &[u16], hidden: bool) -> BusConfig {
    BusConfig {
        multicast_group: Ipv4Addr::LOCALHOST,
        port,
        port_set: PortSet::explicit(peers.to_vec()),
        hidden,
        ..BusConfig::default()
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_find_devices_then_send() {
    let (p1_port, p2_port) = (46101, 46102);
    let ports = [p1_port, p2_port];

    let p1: DeviceBus<Reading> = DeviceBus::open(&loopback_config(p1_port, &ports, false))
        .await
        .unwrap();
    let p2: DeviceBus<Reading> = DeviceBus::open(&loopback_config(p2_port, &ports, true))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    p2.on_common_msg(Arc::new(move |from: SocketAddr, reading: Reading| {
        let _ = tx.send((from, reading));
    }));

    assert_eq!(p1.find_devices(), 2);
    assert!(wait_for(|| p1.devices() == vec![loopback(p2_port)]).await);
    assert!(p1.is_online());
    assert!(p2.is_online());
    // P1 never handshook after P2 came up, and its own traffic is filtered.
    assert!(p2.devices().is_empty());

    // A second FIND gets a duplicate HANDSHAKE; the roster stays the same.
    p1.find_devices();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p1.devices(), vec![loopback(p2_port)]);

    let reading = Reading {
        sensor: "temp".to_string(),
        value: 21.5,
    };
    p1.send(&reading);

    let (from, got) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, loopback(p1_port));
    assert_eq!(got, reading);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "message delivered more than once");

    p1.close();
    p2.close();
}

#[tokio::test]
async fn test_startup_handshake_and_unicast() {
    let (p1_port, p2_port) = (46111, 46112);
    let ports = [p1_port, p2_port];

    let p1: DeviceBus<Reading> = DeviceBus::open(&loopback_config(p1_port, &ports, true))
        .await
        .unwrap();
    let (new_tx, mut new_rx) = mpsc::unbounded_channel();
    p1.on_new_device(Arc::new(move |addr: SocketAddr| {
        let _ = new_tx.send(addr);
    }));

    let p2: DeviceBus<Reading> = DeviceBus::open(&loopback_config(p2_port, &ports, false))
        .await
        .unwrap();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    p2.on_common_msg(Arc::new(move |_: SocketAddr, reading: Reading| {
        let _ = msg_tx.send(reading);
    }));

    let discovered = tokio::time::timeout(Duration::from_secs(2), new_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(discovered, loopback(p2_port));
    assert_eq!(p1.device_info().len(), 1);

    let reading = Reading {
        sensor: "humidity".to_string(),
        value: 0.4,
    };
    assert!(p1.send_to(discovered, &reading));
    let got = tokio::time::timeout(Duration::from_secs(2), msg_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, reading);

    p1.close();
    p2.close();
}

#[tokio::test]
async fn test_own_broadcast_is_not_delivered_to_self() {
    let port = 46121;
    let bus: DeviceBus<Reading> = DeviceBus::open(&loopback_config(port, &[port], false))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.on_common_msg(Arc::new(move |_: SocketAddr, reading: Reading| {
        let _ = tx.send(reading);
    }));

    bus.announce();
    bus.send(&Reading {
        sensor: "self".to_string(),
        value: 1.0,
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(bus.devices().is_empty());
    bus.close();
}

#[tokio::test]
async fn test_remote_event_reaches_peer_handler() {
    let (p1_port, p2_port) = (46131, 46132);
    let ports = [p1_port, p2_port];

    let p1 = EventBus::default();
    let p2 = EventBus::default();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_remote: EventHandler = Arc::new(move |head: &EventHead, params: &[Value]| {
        let _ = tx.send((head.clone(), params.to_vec()));
    });
    assert!(p2.register("ping", &on_remote, Channel::Remote));

    let (self_tx, mut self_rx) = mpsc::unbounded_channel();
    let own_remote: EventHandler = Arc::new(move |head: &EventHead, _: &[Value]| {
        let _ = self_tx.send(head.clone());
    });
    p1.register("ping", &own_remote, Channel::Remote);

    p1.enable_remote_with(loopback_config(p1_port, &ports, false))
        .await
        .unwrap();
    p2.enable_remote_with(loopback_config(p2_port, &ports, false))
        .await
        .unwrap();

    // Native half has no handler on P1; the remote half still goes out.
    assert!(p1.post_channel("ping", Channel::Remote, &[json!(7), json!("seven")]));

    let (head, params) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.key, "ping");
    assert_eq!(head.channel, Channel::Remote);
    assert_eq!(head.origin, Some(loopback(p1_port)));
    assert_eq!(params, vec![json!(7), json!("seven")]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(self_rx.try_recv().is_err(), "own remote event looped back");

    // P2's startup handshake reached P1.
    assert!(wait_for(|| p1.devices().contains(&loopback(p2_port))).await);

    p1.close();
    p2.close();
}

#[tokio::test]
async fn test_remote_unicast_and_native_isolation() {
    let (p1_port, p2_port) = (46141, 46142);
    let ports = [p1_port, p2_port];

    let p1 = EventBus::default();
    let p2 = EventBus::default();

    let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
    let on_remote: EventHandler = Arc::new(move |head: &EventHead, _: &[Value]| {
        let _ = remote_tx.send(head.origin);
    });
    let (native_tx, mut native_rx) = mpsc::unbounded_channel();
    let on_native: EventHandler = Arc::new(move |head: &EventHead, _: &[Value]| {
        let _ = native_tx.send(head.key.clone());
    });
    p2.register("status", &on_remote, Channel::Remote);
    p2.register("status", &on_native, Channel::Native);

    p1.enable_remote_with(loopback_config(p1_port, &ports, true))
        .await
        .unwrap();
    p2.enable_remote_with(loopback_config(p2_port, &ports, true))
        .await
        .unwrap();

    assert!(p1.post_remote("status", Some(loopback(p2_port)), &[json!({"ok": true})]));

    let origin = tokio::time::timeout(Duration::from_secs(2), remote_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(origin, Some(loopback(p1_port)));

    // Remote events never reach the native table.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(native_rx.try_recv().is_err());

    p1.close();
    p2.close();
}

#[tokio::test]
async fn test_multicast_group_discovery() {
    let (p1_port, p2_port) = (47201, 47202);
    let group = MULTICAST_POOL[0];
    let config = |port: u16| BusConfig {
        multicast_group: group,
        port,
        port_set: PortSet::explicit(vec![p1_port, p2_port]),
        ..BusConfig::default()
    };

    let p1: DeviceBus<Reading> = match DeviceBus::open(&config(p1_port)).await {
        Ok(bus) => bus,
        Err(BusError::Multicast { group, source }) => {
            eprintln!("skipping, cannot join {group}: {source}");
            return;
        }
        Err(e) => panic!("open failed: {e}"),
    };
    let p2: DeviceBus<Reading> = DeviceBus::open(&config(p2_port)).await.unwrap();
    assert_eq!(p1.multicast_group(), Some(group));
    assert_eq!(p2.multicast_group(), Some(group));

    let (tx, mut rx) = mpsc::unbounded_channel();
    p1.on_common_msg(Arc::new(move |_: SocketAddr, reading: Reading| {
        let _ = tx.send(reading);
    }));

    // P2's startup HANDSHAKE reaches P1; P1 answers P2's FIND.
    p2.find_devices();
    assert!(wait_for(|| p1.devices().iter().any(|d| d.port() == p2_port)).await);
    assert!(wait_for(|| p2.devices().iter().any(|d| d.port() == p1_port)).await);

    // Our own looped-back traffic never lands in the roster.
    p1.announce();
    p1.send(&Reading {
        sensor: "self".to_string(),
        value: 0.0,
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(p1.devices().iter().all(|d| d.port() != p1_port));
    assert!(p2.devices().iter().all(|d| d.port() != p2_port));
    assert!(rx.try_recv().is_err(), "own multicast message delivered");

    p1.close();
    p2.close();
    assert!(p1.devices().is_empty());
}
