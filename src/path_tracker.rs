//! Per-peer path metadata derived from connection events.
//!
//! The tracker does not dial or classify on its own schedule; it reacts to
//! `Connected`/`NotConnected` events surfaced by the transport's event bus
//! (see [`crate::external::Transport`]) and derives path/transport/IP-version
//! tags by inspecting the connection's remote multiaddress.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::external::{ConnectionInfo, Host, TransportError};
use crate::multiaddr;
use crate::peer_id::PeerIdentifier;

/// Stream protocol used to time a round trip to an already-connected peer.
/// No handler answers it; the rejection itself (`ProtocolNotSupported` or
/// an immediate stream failure) is the measurement.
pub const RTT_PROBE_PROTOCOL: &str = "/overlay/rtt-probe/1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    Direct,
    Relayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Quic,
    Tcp,
    WebSocket,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
    Unknown,
}

/// One tracked peer's current best path, keyed by [`PeerIdentifier`].
#[derive(Debug)]
pub struct PeerPathEntry {
    pub path_type: PathType,
    pub remote_addr: libp2p::Multiaddr,
    pub connected_at: Instant,
    pub transport: Transport,
    pub ip_version: IpVersion,
    pub last_rtt_ms: Option<u64>,
}

/// Aggregate count of connected peers grouped by (path, transport, ip
/// version), recomputed from scratch on every mutation.
pub type PathGauge = HashMap<(PathType, Transport, IpVersion), usize>;

pub struct PathTracker<T: Host> {
    transport: T,
    entries: RwLock<HashMap<PeerIdentifier, PeerPathEntry>>,
}

impl<T: Host> PathTracker<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot every already-connected peer through the same classification
    /// path used by live events. Call once at startup.
    pub async fn snapshot_startup(&self, peers: &[PeerIdentifier]) {
        for peer in peers {
            self.on_connected(*peer).await;
        }
    }

    /// Handle a `Connected` event: inspect current connections to this peer,
    /// preferring any not relay-limited, and store the derived entry.
    pub async fn on_connected(&self, peer: PeerIdentifier) {
        let conns = self.transport.conns_to_peer(peer.as_peer_id()).await;
        let chosen = conns
            .iter()
            .find(|c| !c.limited)
            .or_else(|| conns.first());

        let Some(conn) = chosen else {
            debug!(%peer, "on_connected fired with no current connections, ignoring");
            return;
        };

        let entry = classify_connection(conn);
        debug!(%peer, path = ?entry.path_type, transport = ?entry.transport, "path entry stored");
        self.entries.write().insert(peer, entry);
    }

    /// Handle a `NotConnected` event: drop the entry.
    pub fn on_disconnected(&self, peer: PeerIdentifier) {
        self.entries.write().remove(&peer);
    }

    /// Record a fresh RTT sample against an existing entry, if any.
    pub fn record_rtt(&self, peer: PeerIdentifier, rtt_ms: u64) {
        if let Some(entry) = self.entries.write().get_mut(&peer) {
            entry.last_rtt_ms = Some(rtt_ms);
        }
    }

    /// Time how long the remote takes to reject a stream for
    /// [`RTT_PROBE_PROTOCOL`] and record it as the peer's latest RTT
    /// sample. A peer with no tracked entry (not currently connected) is
    /// skipped rather than probed.
    pub async fn probe_rtt(&self, peer: PeerIdentifier) {
        if self.get(peer).is_none() {
            return;
        }
        let start = Instant::now();
        let result = self.transport.new_stream(peer.as_peer_id(), RTT_PROBE_PROTOCOL).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Err(TransportError::ProtocolNotSupported) | Err(TransportError::StreamFailed(_)) => {
                self.record_rtt(peer, elapsed_ms);
            }
            Ok(_) => self.record_rtt(peer, elapsed_ms),
            Err(e) => debug!(%peer, error = %e, "rtt probe stream attempt failed"),
        }
    }

    pub fn get(&self, peer: PeerIdentifier) -> Option<PeerPathEntry> {
        self.entries.read().get(&peer).cloned()
    }

    pub fn snapshot(&self) -> HashMap<PeerIdentifier, PeerPathEntry> {
        self.entries.read().clone()
    }

    /// Recompute the aggregate gauge from scratch.
    pub fn gauge(&self) -> PathGauge {
        let mut gauge = PathGauge::new();
        for entry in self.entries.read().values() {
            *gauge
                .entry((entry.path_type, entry.transport, entry.ip_version))
                .or_insert(0) += 1;
        }
        gauge
    }
}

fn classify_connection(conn: &ConnectionInfo) -> PeerPathEntry {
    let (path_type, transport, ip_version) = multiaddr::classify(&conn.remote_multiaddr);
    PeerPathEntry {
        path_type,
        remote_addr: conn.remote_multiaddr.clone(),
        connected_at: Instant::now(),
        transport,
        ip_version,
        last_rtt_ms: None,
    }
}

impl Clone for PeerPathEntry {
    fn clone(&self) -> Self {
        Self {
            path_type: self.path_type,
            remote_addr: self.remote_addr.clone(),
            connected_at: self.connected_at,
            transport: self.transport,
            ip_version: self.ip_version,
            last_rtt_ms: self.last_rtt_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test_support::FakeTransport;

    #[tokio::test]
    async fn relayed_connection_classified_as_relayed() {
        let peer = PeerIdentifier::random();
        let target = peer.as_peer_id();
        let addr: libp2p::Multiaddr = format!(
            "/ip4/203.0.113.50/tcp/4001/p2p/{}/p2p-circuit/p2p/{target}",
            PeerIdentifier::random()
        )
        .parse()
        .unwrap();
        let transport = FakeTransport::new();
        transport.push_connection(target, addr, false);
        let tracker = PathTracker::new(transport);

        tracker.on_connected(peer).await;

        let entry = tracker.get(peer).expect("entry present");
        assert_eq!(entry.path_type, PathType::Relayed);
        assert_eq!(entry.transport, Transport::Tcp);
        assert_eq!(entry.ip_version, IpVersion::V4);
    }

    #[tokio::test]
    async fn disconnect_removes_entry() {
        let peer = PeerIdentifier::random();
        let addr: libp2p::Multiaddr = format!("/ip4/9.9.9.9/tcp/1/p2p/{}", peer.as_peer_id())
            .parse()
            .unwrap();
        let transport = FakeTransport::new();
        transport.push_connection(peer.as_peer_id(), addr, false);
        let tracker = PathTracker::new(transport);
        tracker.on_connected(peer).await;
        assert!(tracker.get(peer).is_some());

        tracker.on_disconnected(peer);
        assert!(tracker.get(peer).is_none());
    }

    #[tokio::test]
    async fn prefers_non_limited_connection() {
        let peer = PeerIdentifier::random();
        let relayed: libp2p::Multiaddr = format!(
            "/ip4/1.1.1.1/tcp/1/p2p/{}/p2p-circuit/p2p/{}",
            PeerIdentifier::random(),
            peer.as_peer_id()
        )
        .parse()
        .unwrap();
        let direct: libp2p::Multiaddr = format!("/ip4/2.2.2.2/tcp/1/p2p/{}", peer.as_peer_id())
            .parse()
            .unwrap();
        let transport = FakeTransport::new();
        transport.push_connection(peer.as_peer_id(), relayed, true);
        transport.push_connection(peer.as_peer_id(), direct, false);
        let tracker = PathTracker::new(transport);

        tracker.on_connected(peer).await;

        let entry = tracker.get(peer).unwrap();
        assert_eq!(entry.path_type, PathType::Direct);
    }

    #[tokio::test]
    async fn gauge_groups_by_path_transport_ip_version() {
        let a = PeerIdentifier::random();
        let b = PeerIdentifier::random();
        let transport = FakeTransport::new();
        transport.push_connection(
            a.as_peer_id(),
            format!("/ip4/1.1.1.1/tcp/1/p2p/{}", a.as_peer_id())
                .parse()
                .unwrap(),
            false,
        );
        transport.push_connection(
            b.as_peer_id(),
            format!("/ip4/2.2.2.2/tcp/1/p2p/{}", b.as_peer_id())
                .parse()
                .unwrap(),
            false,
        );
        let tracker = PathTracker::new(transport);
        tracker.on_connected(a).await;
        tracker.on_connected(b).await;

        let gauge = tracker.gauge();
        assert_eq!(
            gauge.get(&(PathType::Direct, Transport::Tcp, IpVersion::V4)),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn rtt_probe_records_a_sample_from_the_rejected_stream() {
        let peer = PeerIdentifier::random();
        let addr: libp2p::Multiaddr = format!("/ip4/3.3.3.3/tcp/1/p2p/{}", peer.as_peer_id())
            .parse()
            .unwrap();
        let transport = FakeTransport::new();
        transport.push_connection(peer.as_peer_id(), addr, false);
        let tracker = PathTracker::new(transport);
        tracker.on_connected(peer).await;
        assert!(tracker.get(peer).unwrap().last_rtt_ms.is_none());

        tracker.probe_rtt(peer).await;

        assert!(tracker.get(peer).unwrap().last_rtt_ms.is_some());
    }

    #[tokio::test]
    async fn rtt_probe_skips_peers_with_no_tracked_entry() {
        let peer = PeerIdentifier::random();
        let transport = FakeTransport::new();
        let tracker = PathTracker::new(transport);

        tracker.probe_rtt(peer).await;

        assert!(tracker.get(peer).is_none());
    }
}
