//! Multiaddress semantics.
//!
//! The core treats `libp2p::Multiaddr` as an ordered sequence of typed
//! protocol components and needs only a handful of operations on it: pull
//! the first component, iterate, parse from text, and classify path/
//! transport/IP-version for the Path Tracker.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

use crate::path_tracker::{IpVersion, PathType, Transport};

#[derive(Debug, Error)]
pub enum MultiaddrError {
    #[error("unparseable multiaddress: {0}")]
    Unparseable(String),
}

/// Parse a canonical multiaddress string, rejecting what doesn't parse.
pub fn parse(text: &str) -> Result<Multiaddr, MultiaddrError> {
    text.parse()
        .map_err(|_| MultiaddrError::Unparseable(text.to_string()))
}

/// The first protocol component, if any.
pub fn first_component(addr: &Multiaddr) -> Option<Protocol<'_>> {
    addr.iter().next()
}

/// The terminal peer identifier carried by a `/p2p/<id>` component, if the
/// multiaddress ends with (or contains) one.
pub fn terminal_peer(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().rev().find_map(|p| match p {
        Protocol::P2p(id) => Some(id),
        _ => None,
    })
}

/// Invariant: the terminal peer identifier, if present, equals the target
/// peer.
pub fn terminal_peer_matches(addr: &Multiaddr, target: PeerId) -> bool {
    match terminal_peer(addr) {
        Some(id) => id == target,
        None => true,
    }
}

/// True iff the address traverses a circuit-relay hop (`/p2p-circuit`).
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Build a circuit address `<relay>/p2p-circuit/p2p/<peer>`.
pub fn circuit_address(relay: &Multiaddr, peer: PeerId) -> Multiaddr {
    let mut addr = relay.clone();
    addr.push(Protocol::P2pCircuit);
    addr.push(Protocol::P2p(peer));
    addr
}

/// Transport tag from the presence of a matching component; QUIC variants
/// coalesce to "quic".
pub fn transport_of(addr: &Multiaddr) -> Transport {
    for p in addr.iter() {
        match p {
            Protocol::QuicV1 | Protocol::Quic => return Transport::Quic,
            Protocol::Tcp(_) => {
                if addr.iter().any(|p| matches!(p, Protocol::Ws(_) | Protocol::Wss(_))) {
                    return Transport::WebSocket;
                }
                return Transport::Tcp;
            }
            _ => continue,
        }
    }
    Transport::Unknown
}

/// IP-version tag from the first network-layer component.
pub fn ip_version_of(addr: &Multiaddr) -> IpVersion {
    match first_component(addr) {
        Some(Protocol::Ip4(_)) => IpVersion::V4,
        Some(Protocol::Ip6(_)) => IpVersion::V6,
        Some(Protocol::Dns4(_)) => IpVersion::V4,
        Some(Protocol::Dns6(_)) => IpVersion::V6,
        _ => IpVersion::Unknown,
    }
}

/// Classify a remote multiaddress into `(path, transport, ip_version)`.
pub fn classify(addr: &Multiaddr) -> (PathType, Transport, IpVersion) {
    let path = if is_relayed(addr) {
        PathType::Relayed
    } else {
        PathType::Direct
    };
    (path, transport_of(addr), ip_version_of(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relayed_tcp_ipv4_classifies() {
        let q = PeerId::random();
        let t = PeerId::random();
        let text = format!("/ip4/203.0.113.50/tcp/4001/p2p/{q}/p2p-circuit/p2p/{t}");
        let addr = parse(&text).unwrap();
        assert_eq!(
            classify(&addr),
            (PathType::Relayed, Transport::Tcp, IpVersion::V4)
        );
    }

    #[test]
    fn direct_quic_ipv6_classifies() {
        let t = PeerId::random();
        let text = format!("/ip6/2001:db8::1/udp/4001/quic-v1/p2p/{t}");
        let addr = parse(&text).unwrap();
        assert_eq!(
            classify(&addr),
            (PathType::Direct, Transport::Quic, IpVersion::V6)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("not a multiaddr").is_err());
    }

    #[test]
    fn terminal_peer_invariant() {
        let t = PeerId::random();
        let other = PeerId::random();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{t}").parse().unwrap();
        assert!(terminal_peer_matches(&addr, t));
        assert!(!terminal_peer_matches(&addr, other));
    }

    #[test]
    fn addr_with_no_terminal_peer_matches_anything() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        assert!(terminal_peer_matches(&addr, PeerId::random()));
    }

    #[test]
    fn circuit_address_roundtrips_components() {
        let relay: Multiaddr = "/ip4/9.9.9.9/tcp/4001".parse().unwrap();
        let peer = PeerId::random();
        let circuit = circuit_address(&relay, peer);
        assert!(is_relayed(&circuit));
        assert_eq!(terminal_peer(&circuit), Some(peer));
    }

    #[test]
    fn websocket_transport_detected() {
        let t = PeerId::random();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/443/ws/p2p/{t}").parse().unwrap();
        assert_eq!(transport_of(&addr), Transport::WebSocket);
    }
}
