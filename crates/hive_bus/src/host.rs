//! Local host addresses, used to recognise our own datagrams when they loop
//! back through the multicast group.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::debug;

/// Map an address to IPv4, unwrapping IPv4-mapped IPv6 addresses.
pub fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Every IPv4 address this host is likely to send from.
///
/// Combines loopback, the addresses the hostname resolves to, and the
/// source address the OS picks when routing towards `route_hint`.
/// Deduplicated, insertion-ordered.
pub fn local_ipv4_addrs(route_hint: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut addrs = vec![Ipv4Addr::LOCALHOST];

    match whoami::fallible::hostname() {
        Ok(name) => match (name.as_str(), 0).to_socket_addrs() {
            Ok(resolved) => {
                addrs.extend(resolved.filter_map(|a| to_ipv4(a.ip())));
            }
            Err(e) => debug!("Hostname {name} did not resolve: {e}"),
        },
        Err(e) => debug!("Cannot read hostname: {e}"),
    }

    // Connecting a UDP socket sends nothing; it only asks the OS for a route.
    if let Some(ip) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.connect((route_hint, 9)).map(|_| s))
        .and_then(|s| s.local_addr())
        .ok()
        .and_then(|a| to_ipv4(a.ip()))
    {
        addrs.push(ip);
    }

    let mut seen = Vec::with_capacity(addrs.len());
    for ip in addrs {
        if !ip.is_unspecified() && !seen.contains(&ip) {
            seen.push(ip);
        }
    }
    seen
}

/// Whether `src` is one of our own addresses on our own receive port.
pub fn is_self(src: SocketAddr, local_addrs: &[Ipv4Addr], local_port: u16) -> bool {
    src.port() == local_port && to_ipv4(src.ip()).is_some_and(|ip| local_addrs.contains(&ip))
}
