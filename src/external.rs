//! Contracts for collaborators injected from outside the connectivity core:
//! the transport/host, identity store, routing oracle, connection gater,
//! metrics and reputation sinks, and the gossip state provider. The core
//! depends on these traits but never implements the real thing — the CLI,
//! transport crate, and key-storage layer wire in their own
//! implementations at startup.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::gossip::NodeAnnouncement;
use crate::path_tracker::PathType;
use crate::peer_id::PeerIdentifier;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("stream open failed: {0}")]
    StreamFailed(String),
    #[error("connection closed by remote")]
    Closed,
    #[error("protocol not supported")]
    ProtocolNotSupported,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("peer not found")]
    NotFound,
    #[error("routing query timed out")]
    Timeout,
}

/// A duplex byte stream, half-close aware, as handed back by `new_stream`.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for S {}
pub type BoxedStream = Pin<Box<dyn AsyncDuplex>>;

/// One connection to a remote peer, as seen through the host's connection
/// list.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_multiaddr: Multiaddr,
    /// Mirrors `Stat().Limited`: true for relay-circuit connections that
    /// have not yet been upgraded to a direct path.
    pub limited: bool,
}

/// Per-dial hints the core passes down to the transport. `force_direct` is
/// set by the LAN-discovery and probe-worker upgrade paths so the
/// transport establishes a new direct path alongside an existing relay
/// connection rather than treating the peer as already connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOpts {
    pub force_direct: bool,
}

impl DialOpts {
    pub fn force_direct() -> Self {
        Self { force_direct: true }
    }
}

/// A peer connectedness transition as delivered by the host's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectednessEvent {
    Connected(PeerId),
    NotConnected(PeerId),
}

/// The transport/host contract: dialing, stream opening, the live
/// connection list, peerstore hints, and the connectedness event bus.
///
/// Every method here crosses a process or OS boundary and must suspend
/// rather than block; none may be called while holding one of this crate's
/// own locks.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    async fn connect(&self, addr: &Multiaddr, opts: DialOpts) -> Result<(), TransportError>;

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
    ) -> Result<BoxedStream, TransportError>;

    async fn conns_to_peer(&self, peer: PeerId) -> Vec<ConnectionInfo>;

    /// Hint the peerstore about addresses worth remembering for `ttl`.
    async fn add_addrs(&self, peer: PeerId, addrs: Vec<Multiaddr>, ttl: Duration);

    /// Addresses the peerstore currently remembers for `peer`, including
    /// ones hinted in by a prior `add_addrs` whose TTL has not yet expired.
    /// Unlike `conns_to_peer`, these are not necessarily connected — the
    /// probe worker uses this to recover a peer's direct address when every
    /// live connection to it is relay-limited.
    async fn peerstore_addrs(&self, peer: PeerId) -> Vec<Multiaddr>;

    /// Close one connection to `peer` identified by its remote
    /// multiaddress. Used by the post-upgrade relay sweep; closing a
    /// connection that no longer exists is not an error.
    async fn close_connection(&self, peer: PeerId, addr: &Multiaddr) -> Result<(), TransportError>;

    /// Subscribe to connectedness transitions. Each subscriber gets its own
    /// receiver; events already delivered to other subscribers are not
    /// replayed.
    fn subscribe_connectedness(&self) -> broadcast::Receiver<ConnectednessEvent>;
}

/// Returns the node's own long-lived identity. The core never mints or
/// stores key material itself.
pub trait IdentityStore: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerIdentifier;
}

/// Optional DHT-like routing oracle used by the Path Dialer's slow path.
#[async_trait]
pub trait RoutingOracle: Send + Sync + 'static {
    async fn find_peer(&self, peer: PeerId, timeout: Duration) -> Result<Multiaddr, RoutingError>;
}

/// Synchronous authorization predicate, applied by the transport at
/// handshake time. The core never calls this directly — a peer rejected
/// here simply never produces a Connected event — but the contract is
/// named here because `SetWatchlist` callers are expected to keep it in
/// sync with the authorized set.
pub trait ConnectionGater: Send + Sync + 'static {
    fn is_authorized(&self, peer: &PeerIdentifier) -> bool;
}

/// Nil-safe metrics sink: counter and histogram vectors addressed by string
/// label. A missing sink must never be a reason to skip emitting a metric,
/// so implementors (including [`crate::metrics::NoopMetrics`]) are total
/// functions, not `Option`.
pub trait MetricsSink: Send + Sync + 'static {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]);
    fn observe_histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

/// Optional per-connection reputation recorder.
#[async_trait]
pub trait ReputationSink: Send + Sync + 'static {
    async fn record_connection(&self, peer: PeerIdentifier, path: PathType, latency_ms: u64);
}

/// Thunk returning a freshly-built announcement; the gossip component
/// overwrites `originator` and `hops` before it ever reaches the wire.
pub trait GossipStateProvider: Send + Sync + 'static {
    fn build_announcement(&self) -> NodeAnnouncement;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;

    /// An in-memory [`Host`] double: connections are seeded by the test,
    /// dials always succeed, and connectedness events are broadcast to
    /// whichever subscribers were registered at send time.
    #[derive(Clone)]
    pub struct FakeTransport {
        inner: Arc<FakeTransportInner>,
    }

    struct FakeTransportInner {
        conns: RwLock<HashMap<PeerId, Vec<ConnectionInfo>>>,
        peerstore: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
        events: broadcast::Sender<ConnectednessEvent>,
        dial_failures: RwLock<std::collections::HashSet<PeerId>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            let (events, _) = broadcast::channel(256);
            Self {
                inner: Arc::new(FakeTransportInner {
                    conns: RwLock::new(HashMap::new()),
                    peerstore: RwLock::new(HashMap::new()),
                    events,
                    dial_failures: RwLock::new(std::collections::HashSet::new()),
                }),
            }
        }

        pub fn push_connection(&self, peer: PeerId, addr: Multiaddr, limited: bool) {
            self.inner
                .conns
                .write()
                .entry(peer)
                .or_default()
                .push(ConnectionInfo {
                    remote_multiaddr: addr,
                    limited,
                });
        }

        pub fn clear_connections(&self, peer: PeerId) {
            self.inner.conns.write().remove(&peer);
        }

        pub fn fail_dials_to(&self, peer: PeerId) {
            self.inner.dial_failures.write().insert(peer);
        }

        pub fn emit(&self, event: ConnectednessEvent) {
            let _ = self.inner.events.send(event);
        }
    }

    impl Default for FakeTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Host for FakeTransport {
        async fn connect(&self, addr: &Multiaddr, _opts: DialOpts) -> Result<(), TransportError> {
            if let Some(peer) = crate::multiaddr::terminal_peer(addr) {
                if self.inner.dial_failures.read().contains(&peer) {
                    return Err(TransportError::DialFailed("fake dial failure".into()));
                }
            }
            Ok(())
        }

        async fn close_connection(&self, peer: PeerId, addr: &Multiaddr) -> Result<(), TransportError> {
            self.inner
                .conns
                .write()
                .entry(peer)
                .or_default()
                .retain(|c| &c.remote_multiaddr != addr);
            Ok(())
        }

        async fn new_stream(
            &self,
            _peer: PeerId,
            protocol: &str,
        ) -> Result<BoxedStream, TransportError> {
            Err(TransportError::StreamFailed(format!(
                "fake transport does not open streams for {protocol}"
            )))
        }

        async fn conns_to_peer(&self, peer: PeerId) -> Vec<ConnectionInfo> {
            self.inner
                .conns
                .read()
                .get(&peer)
                .cloned()
                .unwrap_or_default()
        }

        async fn add_addrs(&self, peer: PeerId, addrs: Vec<Multiaddr>, _ttl: Duration) {
            self.inner.peerstore.write().entry(peer).or_default().extend(addrs);
        }

        async fn peerstore_addrs(&self, peer: PeerId) -> Vec<Multiaddr> {
            self.inner.peerstore.read().get(&peer).cloned().unwrap_or_default()
        }

        fn subscribe_connectedness(&self) -> broadcast::Receiver<ConnectednessEvent> {
            self.inner.events.subscribe()
        }
    }
}
