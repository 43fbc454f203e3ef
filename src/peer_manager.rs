//! Peer Manager: the scheduler that keeps the Authorized Set connected.
//!
//! Three concurrent workers share one `ManagedPeer` map under a single
//! cancellation token: an event worker that reacts to connectedness
//! transitions, a reconnect worker that dials disconnected peers under
//! backoff, and a probe worker that looks for a direct upgrade on peers
//! stuck behind a relay.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerManagerConfig;
use crate::external::{ConnectednessEvent, Host, MetricsSink, ReputationSink, RoutingError, RoutingOracle};
use crate::gossip::ConnectedPeerSource;
use crate::path_dialer::PathDialer;
use crate::path_tracker::PathType;
use crate::peer_id::{AuthorizedSet, PeerIdentifier};

#[derive(Debug, Error)]
pub enum PeerManagerError {
    #[error("peer manager already stopped")]
    Stopped,
}

/// Mutable per-peer record. Exclusively owned by the Peer Manager; any copy
/// handed out to a caller is a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ManagedPeer {
    pub connected: bool,
    pub last_seen: Option<SystemTime>,
    pub last_dial_attempt: Option<SystemTime>,
    pub last_dial_error: Option<String>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<SystemTime>,
    pub probe_until: Option<SystemTime>,
}

const MAX_ERROR_LEN: usize = 200;

fn truncate_error(err: &str) -> String {
    let first_line = err.lines().next().unwrap_or("");
    first_line.chars().take(MAX_ERROR_LEN).collect()
}

/// Backoff for the k-th consecutive failure, base 30s doubled up to 2^5,
/// capped at 15 minutes.
fn backoff_duration(config: &PeerManagerConfig, consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.min(5);
    let scaled = config.backoff_base.saturating_mul(1u32 << exp);
    scaled.min(config.backoff_max)
}

pub struct PeerManager<H: Host> {
    config: PeerManagerConfig,
    host: Arc<H>,
    dialer: Arc<PathDialer<H>>,
    routing: Option<Arc<dyn RoutingOracle>>,
    metrics: Arc<dyn MetricsSink>,
    reputation: Option<Arc<dyn ReputationSink>>,
    self_id: PeerIdentifier,
    peers: RwLock<HashMap<PeerIdentifier, ManagedPeer>>,
    reconnect_tokens: Arc<Semaphore>,
}

impl<H: Host> PeerManager<H> {
    pub fn new(
        config: PeerManagerConfig,
        host: Arc<H>,
        dialer: Arc<PathDialer<H>>,
        routing: Option<Arc<dyn RoutingOracle>>,
        metrics: Arc<dyn MetricsSink>,
        reputation: Option<Arc<dyn ReputationSink>>,
        self_id: PeerIdentifier,
    ) -> Self {
        let reconnect_tokens = Arc::new(Semaphore::new(config.reconnect_concurrency));
        Self {
            config,
            host,
            dialer,
            routing,
            metrics,
            reputation,
            self_id,
            peers: RwLock::new(HashMap::new()),
            reconnect_tokens,
        }
    }

    /// Replace the tracked set. Peers removed are destroyed; peers added
    /// are created with their current connectedness. Self is excluded.
    pub async fn set_watchlist(&self, ids: &AuthorizedSet) {
        let mut wanted: AuthorizedSet = ids.clone();
        wanted.remove(&self.self_id);

        let to_create: Vec<PeerIdentifier> = {
            let peers = self.peers.read();
            wanted.iter().filter(|id| !peers.contains_key(id)).copied().collect()
        };

        {
            let mut peers = self.peers.write();
            peers.retain(|id, _| wanted.contains(id));
        }

        for id in to_create {
            let conns = self.host.conns_to_peer(id.as_peer_id()).await;
            let mut peer = ManagedPeer::default();
            if !conns.is_empty() {
                peer.connected = true;
                peer.last_seen = Some(SystemTime::now());
            }
            self.peers.write().insert(id, peer);
        }
    }

    /// Clears backoff and failure counters on every managed peer.
    pub fn on_network_change(&self) {
        let mut peers = self.peers.write();
        for peer in peers.values_mut() {
            peer.consecutive_failures = 0;
            peer.backoff_until = None;
        }
        debug!(count = peers.len(), "network change cleared backoff state");
    }

    pub fn get_managed_peers(&self) -> HashMap<PeerIdentifier, ManagedPeer> {
        self.peers.read().clone()
    }

    /// Run all three workers until `cancel` fires.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let event = self.clone().event_worker(cancel.clone());
        let reconnect = self.clone().reconnect_worker(cancel.clone());
        let probe = self.clone().probe_worker(cancel.clone());
        tokio::join!(event, reconnect, probe);
    }

    async fn event_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.host.subscribe_connectedness();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(ConnectednessEvent::Connected(peer)) => self.handle_connected(peer),
                        Ok(ConnectednessEvent::NotConnected(peer)) => self.handle_not_connected(peer),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "peer manager event worker lagged behind connectedness events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    fn handle_connected(&self, peer: PeerId) {
        let id = PeerIdentifier::from_peer_id(peer);
        let mut peers = self.peers.write();
        if let Some(managed) = peers.get_mut(&id) {
            managed.connected = true;
            managed.last_seen = Some(SystemTime::now());
            managed.consecutive_failures = 0;
            managed.backoff_until = None;
            managed.last_dial_error = None;
        }
    }

    fn handle_not_connected(&self, peer: PeerId) {
        let id = PeerIdentifier::from_peer_id(peer);
        let mut peers = self.peers.write();
        if let Some(managed) = peers.get_mut(&id) {
            let in_cooldown = managed
                .probe_until
                .map(|until| SystemTime::now() < until)
                .unwrap_or(false);
            managed.connected = false;
            debug!(%id, in_probe_cooldown = in_cooldown, "peer disconnected");
        }
    }

    async fn reconnect_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.reconnect_tick(&cancel).await,
            }
        }
    }

    async fn reconnect_tick(self: &Arc<Self>, cancel: &CancellationToken) {
        let now = SystemTime::now();
        let candidates: Vec<PeerIdentifier> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, p)| {
                    !p.connected
                        && p.probe_until.map(|u| now >= u).unwrap_or(true)
                        && p.backoff_until.map(|u| now >= u).unwrap_or(true)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut handles = Vec::new();
        for id in candidates {
            let this = self.clone();
            let cancel = cancel.clone();
            let permit = this.reconnect_tokens.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                this.attempt_reconnect(id, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn attempt_reconnect(&self, id: PeerIdentifier, cancel: CancellationToken) {
        {
            let mut peers = self.peers.write();
            if let Some(p) = peers.get_mut(&id) {
                p.last_dial_attempt = Some(SystemTime::now());
            }
        }

        let result = self.dialer.dial(id.as_peer_id(), cancel).await;
        match result {
            Ok(outcome) => {
                {
                    let mut peers = self.peers.write();
                    if let Some(p) = peers.get_mut(&id) {
                        p.connected = true;
                        p.last_seen = Some(SystemTime::now());
                        p.consecutive_failures = 0;
                        p.backoff_until = None;
                        p.last_dial_error = None;
                    }
                }
                if let Some(reputation) = &self.reputation {
                    reputation
                        .record_connection(id, outcome.path_type, outcome.duration.as_millis() as u64)
                        .await;
                }
                info!(%id, path = ?outcome.path_type, "reconnect succeeded");
            }
            Err(e) => {
                let mut peers = self.peers.write();
                if let Some(p) = peers.get_mut(&id) {
                    p.consecutive_failures += 1;
                    p.last_dial_error = Some(truncate_error(&e.to_string()));
                    let until = SystemTime::now() + backoff_duration(&self.config, p.consecutive_failures);
                    p.backoff_until = Some(until);
                }
            }
        }
    }

    async fn probe_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.probe_tick().await,
            }
        }
    }

    async fn probe_tick(&self) {
        let candidates: Vec<PeerIdentifier> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, p)| p.connected)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in candidates {
            let conns = self.host.conns_to_peer(id.as_peer_id()).await;
            if conns.is_empty() || conns.iter().any(|c| !c.limited) {
                continue;
            }
            self.probe_peer(id).await;
        }
    }

    async fn probe_peer(&self, id: PeerIdentifier) {
        if let Some(routing) = &self.routing {
            let found = tokio::time::timeout(
                Duration::from_secs(10),
                routing.find_peer(id.as_peer_id(), Duration::from_secs(10)),
            )
            .await
            .unwrap_or(Err(RoutingError::Timeout));
            if let Ok(addr) = found {
                self.host
                    .add_addrs(id.as_peer_id(), vec![addr], Duration::from_secs(10 * 60))
                    .await;
            }
        }

        let remotes = self.remote_global_v6_candidates(id).await;
        if remotes.is_empty() {
            return;
        }
        let locals = match crate::iface::enumerate().await {
            Ok(summary) => summary.global_v6,
            Err(_) => return,
        };

        for local in &locals {
            for remote in &remotes {
                if self.handshake_probe(*local, *remote).await {
                    self.force_direct_upgrade(id, *remote).await;
                    return;
                }
            }
        }
    }

    /// Global-IPv6 socket addresses the peerstore remembers for `id`. The
    /// peers this is called for are connected only over a relay-limited
    /// connection, so that connection's own remote multiaddress names the
    /// relay, not the peer — the direct address and port have to come from
    /// whatever the routing oracle lookup in `probe_peer` (or an earlier
    /// gossip/LAN-discovery hint) already wrote into the peerstore.
    async fn remote_global_v6_candidates(&self, id: PeerIdentifier) -> Vec<SocketAddr> {
        let addrs = self.host.peerstore_addrs(id.as_peer_id()).await;
        let mut candidates = Vec::new();
        for addr in &addrs {
            let components: Vec<_> = addr.iter().collect();
            for pair in components.windows(2) {
                if let (libp2p::multiaddr::Protocol::Ip6(ip), libp2p::multiaddr::Protocol::Tcp(port)) =
                    (&pair[0], &pair[1])
                {
                    if is_global_unicast_v6(*ip) {
                        candidates.push(SocketAddr::new(IpAddr::V6(*ip), *port));
                    }
                }
            }
        }
        candidates
    }

    /// Raw TCP handshake with a 3 s timeout, binding the local side
    /// explicitly so the OS routing table cannot pick an interface that
    /// can't actually reach the peer.
    async fn handshake_probe(&self, local: Ipv6Addr, remote: SocketAddr) -> bool {
        let Ok(socket) = TcpSocket::new_v6() else {
            return false;
        };
        if socket.bind(SocketAddr::new(IpAddr::V6(local), 0)).is_err() {
            return false;
        }
        let result = tokio::time::timeout(self.config.probe_handshake_timeout, socket.connect(remote)).await;
        matches!(result, Ok(Ok(_stream)))
    }

    async fn force_direct_upgrade(&self, id: PeerIdentifier, remote: SocketAddr) {
        let tcp_addr: Multiaddr = format!("/ip6/{}/tcp/{}", remote.ip(), remote.port())
            .parse()
            .expect("constructed multiaddress is well-formed");
        let quic_addr: Multiaddr = format!("/ip6/{}/udp/{}/quic-v1", remote.ip(), remote.port())
            .parse()
            .expect("constructed multiaddress is well-formed");
        self.host
            .add_addrs(
                id.as_peer_id(),
                vec![tcp_addr, quic_addr],
                Duration::from_secs(10 * 60),
            )
            .await;

        let cancel = CancellationToken::new();
        let dial = tokio::time::timeout(
            self.config.probe_dial_timeout,
            self.dialer.dial_force_direct(id.as_peer_id(), cancel),
        )
        .await;
        if let Ok(Ok(outcome)) = dial {
            if outcome.path_type == PathType::Direct {
                let mut peers = self.peers.write();
                if let Some(p) = peers.get_mut(&id) {
                    p.connected = true;
                    p.last_seen = Some(SystemTime::now());
                    p.probe_until = Some(SystemTime::now() + self.config.probe_cooldown);
                }
                drop(peers);
                self.metrics.incr_counter("peer_manager_direct_upgrade_total", &[]);
                spawn_relay_sweep(self.host.clone(), id.as_peer_id());
            }
        }
    }
}

impl<H: Host> ConnectedPeerSource for PeerManager<H> {
    fn connected_peers(&self) -> Vec<PeerIdentifier> {
        self.peers
            .read()
            .iter()
            .filter(|(_, p)| p.connected)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn is_global_unicast_v6(addr: Ipv6Addr) -> bool {
    crate::iface::is_global_unicast_v6(addr)
}

/// Close relay-limited connections to `peer` now, and again every 10 s for
/// 90 s, to catch relay connections the remote side may re-establish.
fn spawn_relay_sweep<H: Host>(host: Arc<H>, peer: PeerId) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
        loop {
            let conns = host.conns_to_peer(peer).await;
            for conn in conns.into_iter().filter(|c| c.limited) {
                debug!(%peer, addr = %conn.remote_multiaddr, "sweeping relay-limited connection after direct upgrade");
                if let Err(e) = host.close_connection(peer, &conn.remote_multiaddr).await {
                    debug!(%peer, error = %e, "relay sweep close_connection failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DialerConfig;
    use crate::external::test_support::FakeTransport;
    use crate::metrics::NoopMetrics;

    #[test]
    fn backoff_doubles_up_to_five_then_caps() {
        let config = PeerManagerConfig::default();
        assert_eq!(backoff_duration(&config, 0), Duration::from_secs(30));
        assert_eq!(backoff_duration(&config, 1), Duration::from_secs(60));
        assert_eq!(backoff_duration(&config, 5), config.backoff_max);
        assert_eq!(backoff_duration(&config, 9), config.backoff_max);
    }

    #[test]
    fn truncate_error_keeps_first_line_bounded() {
        let long = "a".repeat(300);
        let multi = format!("{long}\nsecond line");
        let truncated = truncate_error(&multi);
        assert_eq!(truncated.len(), MAX_ERROR_LEN);
        assert!(!truncated.contains('\n'));
    }

    fn test_manager(self_id: PeerIdentifier) -> PeerManager<FakeTransport> {
        let host = Arc::new(FakeTransport::new());
        let dialer = Arc::new(PathDialer::new(
            host.clone(),
            None,
            Arc::new(NoopMetrics),
            Vec::new(),
            DialerConfig::default(),
        ));
        PeerManager::new(
            PeerManagerConfig::default(),
            host,
            dialer,
            None,
            Arc::new(NoopMetrics),
            None,
            self_id,
        )
    }

    #[tokio::test]
    async fn set_watchlist_tracks_exactly_the_authorized_set_minus_self() {
        let self_id = PeerIdentifier::random();
        let manager = test_manager(self_id);
        let a = PeerIdentifier::random();
        let b = PeerIdentifier::random();
        let mut wanted = AuthorizedSet::new();
        wanted.insert(a);
        wanted.insert(b);
        wanted.insert(self_id);

        manager.set_watchlist(&wanted).await;

        let tracked = manager.get_managed_peers();
        assert_eq!(tracked.len(), 2);
        assert!(tracked.contains_key(&a));
        assert!(tracked.contains_key(&b));
        assert!(!tracked.contains_key(&self_id));
    }

    #[tokio::test]
    async fn set_watchlist_drops_peers_no_longer_in_the_set_and_keeps_survivors() {
        let self_id = PeerIdentifier::random();
        let manager = test_manager(self_id);
        let a = PeerIdentifier::random();
        let b = PeerIdentifier::random();
        let mut first: AuthorizedSet = AuthorizedSet::new();
        first.insert(a);
        first.insert(b);
        manager.set_watchlist(&first).await;
        assert_eq!(manager.get_managed_peers().len(), 2);

        let mut second: AuthorizedSet = AuthorizedSet::new();
        second.insert(b);
        manager.set_watchlist(&second).await;

        let tracked = manager.get_managed_peers();
        assert_eq!(tracked.len(), 1);
        assert!(tracked.contains_key(&b));
        assert!(!tracked.contains_key(&a));
    }

    #[test]
    fn on_network_change_clears_backoff_and_failures() {
        let self_id = PeerIdentifier::random();
        let manager = test_manager(self_id);
        let a = PeerIdentifier::random();
        manager.peers.write().insert(
            a,
            ManagedPeer {
                consecutive_failures: 4,
                backoff_until: Some(SystemTime::now() + Duration::from_secs(60)),
                ..Default::default()
            },
        );

        manager.on_network_change();

        let tracked = manager.get_managed_peers();
        let entry = tracked.get(&a).unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert!(entry.backoff_until.is_none());
    }
}
