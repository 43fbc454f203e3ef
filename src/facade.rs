//! Network Façade: composes every connectivity subsystem behind a single
//! start/stop lifecycle.
//!
//! This is the one type most embedders touch directly. It owns the root
//! cancellation token, wires the Network Monitor's change events into the
//! four downstream reactions named in the design (re-probe, re-browse,
//! backoff reset, immediate gossip), and republishes a default
//! [`crate::external::GossipStateProvider`] built from the classifier and
//! the Peer Manager's own connected-peer count when the embedder doesn't
//! supply one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::Multiaddr;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::OverlayError;
use crate::external::{
    ConnectionGater, GossipStateProvider, Host, IdentityStore, MetricsSink, ReputationSink,
    RoutingOracle,
};
use crate::gossip::{Gossip, NodeAnnouncement};
use crate::iface::{self, InterfaceSummary};
use crate::lan_discovery::LanDiscovery;
pub use crate::net_monitor::NetworkChange;
use crate::net_monitor::NetworkMonitor;
use crate::metrics::NoopMetrics;
use crate::path_dialer::PathDialer;
use crate::path_tracker::{PathGauge, PathTracker, PeerPathEntry};
use crate::peer_id::{AuthorizedSet, PeerIdentifier};
use crate::peer_manager::{ManagedPeer, PeerManager};
use crate::reachability::{self, Grade};
use crate::stun::{self, NatFamily, StunResult};

/// Latest fused output of the Interface Inventory and STUN Prober, as
/// consumed by the Reachability Classifier. Refreshed on demand (at
/// startup) and on every [`NetworkChange`].
#[derive(Debug, Clone)]
pub struct ReachabilitySnapshot {
    pub ifaces: InterfaceSummary,
    pub stun: Option<StunResult>,
    pub grade: Grade,
}

impl Default for ReachabilitySnapshot {
    fn default() -> Self {
        Self {
            ifaces: InterfaceSummary::default(),
            stun: None,
            grade: Grade::F,
        }
    }
}

const STUN_PROBE_BUDGET: Duration = Duration::from_secs(10);

/// The connectivity core's single composition root. Generic over the
/// transport/host type, which must be a cheap-to-clone handle (mirroring
/// how `libp2p`'s own `Swarm` handles are typically wrapped).
pub struct Network<H: Host + Clone> {
    config: Config,
    self_id: PeerIdentifier,
    host: H,
    cancel: CancellationToken,
    dialer: Arc<PathDialer<H>>,
    peer_manager: Arc<PeerManager<H>>,
    path_tracker: Arc<PathTracker<H>>,
    gossip: Arc<Gossip<H>>,
    lan_discovery: Arc<LanDiscovery<H>>,
    net_monitor: Arc<NetworkMonitor>,
    reachability: Arc<RwLock<ReachabilitySnapshot>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

/// Derives a [`NodeAnnouncement`] from the facade's own classifier state
/// and the Peer Manager's connected-peer count. Used when the embedder
/// does not supply its own [`GossipStateProvider`]; `originator`, `hops`,
/// `v`, and `ts` are overwritten by [`Gossip`] regardless of what is
/// returned here.
struct DefaultStateProvider<H: Host> {
    peer_manager: Arc<PeerManager<H>>,
    reachability: Arc<RwLock<ReachabilitySnapshot>>,
    self_id: PeerIdentifier,
    started_at: Instant,
}

impl<H: Host> GossipStateProvider for DefaultStateProvider<H> {
    fn build_announcement(&self) -> NodeAnnouncement {
        use crate::gossip::ConnectedPeerSource;
        let snapshot = self.reachability.read();
        NodeAnnouncement {
            v: 1,
            from: self.self_id,
            grade: snapshot.grade,
            nat_type: snapshot
                .stun
                .as_ref()
                .map(|s| s.nat_family)
                .unwrap_or(NatFamily::Unknown),
            ipv4: snapshot.ifaces.has_global_ipv4(),
            ipv6: snapshot.ifaces.has_global_ipv6(),
            cgnat: snapshot.stun.as_ref().map(|s| s.cgnat).unwrap_or(false),
            uptime_sec: self.started_at.elapsed().as_secs(),
            peer_count: self.peer_manager.connected_peers().len() as u32,
            ts: 0,
            hops: 0,
        }
    }
}

impl<H: Host + Clone> Network<H> {
    /// Construct every subsystem. Invalid configuration (bad relay
    /// addresses, zero concurrency, an empty service type) is a programmer
    /// error and is rejected here rather than surfacing later.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        host: H,
        identity: &dyn IdentityStore,
        routing: Option<Arc<dyn RoutingOracle>>,
        peer_filter: Option<Arc<dyn ConnectionGater>>,
        metrics: Option<Arc<dyn MetricsSink>>,
        reputation: Option<Arc<dyn ReputationSink>>,
        state_provider: Option<Arc<dyn GossipStateProvider>>,
    ) -> Result<Self, OverlayError> {
        config.validate()?;

        let self_id = identity.local_peer_id();
        let metrics = metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let host_arc = Arc::new(host.clone());

        let relay_addresses: Vec<Multiaddr> = config
            .relay_addresses
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| OverlayError::InvalidConfig(format!("invalid relay address {s:?}: {e}")))
            })
            .collect::<Result<_, _>>()?;

        let dialer = Arc::new(PathDialer::new(
            host_arc.clone(),
            routing.clone(),
            metrics.clone(),
            relay_addresses,
            config.dialer.clone(),
        ));

        let peer_manager = Arc::new(PeerManager::new(
            config.peer_manager.clone(),
            host_arc.clone(),
            dialer.clone(),
            routing,
            metrics.clone(),
            reputation,
            self_id,
        ));

        let path_tracker = Arc::new(PathTracker::new(host.clone()));
        let reachability = Arc::new(RwLock::new(ReachabilitySnapshot::default()));

        let state_provider = state_provider.unwrap_or_else(|| {
            Arc::new(DefaultStateProvider {
                peer_manager: peer_manager.clone(),
                reachability: reachability.clone(),
                self_id,
                started_at: Instant::now(),
            })
        });

        let gossip = Arc::new(Gossip::new(
            config.gossip.clone(),
            self_id,
            host_arc.clone(),
            state_provider,
            peer_manager.clone(),
            peer_filter,
        ));

        let lan_discovery = Arc::new(LanDiscovery::new(
            config.lan_discovery.clone(),
            self_id,
            host_arc,
        ));

        let net_monitor = Arc::new(NetworkMonitor::new(config.network_monitor.clone()));

        Ok(Self {
            config,
            self_id,
            host,
            cancel: CancellationToken::new(),
            dialer,
            peer_manager,
            path_tracker,
            gossip,
            lan_discovery,
            net_monitor,
            reachability,
            tasks: RwLock::new(Vec::new()),
        })
    }

    /// Start every background worker: the Network Monitor, the Peer
    /// Manager's three workers, the gossip publisher/eviction pair, LAN
    /// Discovery's advertiser/browser pair, a connectedness listener
    /// feeding the Path Tracker, and a Network Monitor consumer wiring the
    /// four reactions named in §4.3. `own_addresses` are this node's own
    /// listen multiaddresses, used only to build the LAN advertisement
    /// (the core has no other way to learn them).
    pub async fn start(&self, watchlist: AuthorizedSet, own_addresses: Vec<Multiaddr>) {
        self.classify_now().await;

        self.peer_manager.set_watchlist(&watchlist).await;
        let already_connected: Vec<PeerIdentifier> = self
            .peer_manager
            .get_managed_peers()
            .into_iter()
            .filter(|(_, p)| p.connected)
            .map(|(id, _)| id)
            .collect();
        self.path_tracker.snapshot_startup(&already_connected).await;

        let mut tasks = self.tasks.write();

        let monitor = self.net_monitor.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { monitor.run(cancel).await }));

        let peer_manager = self.peer_manager.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { peer_manager.run(cancel).await }));

        let gossip = self.gossip.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move { gossip.run(cancel).await }));

        let lan_discovery = self.lan_discovery.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(
            async move { lan_discovery.run(own_addresses, cancel).await },
        ));

        let host = self.host.clone();
        let path_tracker = self.path_tracker.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            path_tracker_worker(host, path_tracker, cancel).await
        }));

        let cancel = self.cancel.clone();
        let change_rx = self.net_monitor.subscribe();
        let stun_config = self.config.stun.clone();
        let reachability = self.reachability.clone();
        let peer_manager = self.peer_manager.clone();
        let lan_discovery = self.lan_discovery.clone();
        let gossip = self.gossip.clone();
        tasks.push(tokio::spawn(async move {
            network_change_worker(
                change_rx,
                stun_config,
                reachability,
                peer_manager,
                lan_discovery,
                gossip,
                cancel,
            )
            .await
        }));

        info!(peer = %self.self_id, "network façade started");
    }

    /// Run one Interface Inventory + STUN Prober + Reachability Classifier
    /// pass and store the result. Called once at startup and again on
    /// every [`NetworkChange`].
    async fn classify_now(&self) {
        let ifaces = match iface::enumerate().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "interface enumeration failed during classification");
                InterfaceSummary::default()
            }
        };
        let cgnat = ifaces.has_cgnat_address();
        let stun_result = stun::probe(&self.config.stun, STUN_PROBE_BUDGET, cgnat).await.ok();
        let grade = reachability::grade(&ifaces, stun_result.as_ref());
        *self.reachability.write() = ReachabilitySnapshot {
            ifaces,
            stun: stun_result,
            grade,
        };
    }

    /// Cancel every background task and wait for them to return. Dials in
    /// progress observe the cancellation and return a cancelled error;
    /// callbacks invoked after this point are no-ops.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.write());
        for handle in handles {
            let _ = handle.await;
        }
        info!(peer = %self.self_id, "network façade stopped");
    }

    pub fn self_id(&self) -> PeerIdentifier {
        self.self_id
    }

    pub async fn set_watchlist(&self, ids: AuthorizedSet) {
        self.peer_manager.set_watchlist(&ids).await;
    }

    pub fn get_managed_peers(&self) -> HashMap<PeerIdentifier, ManagedPeer> {
        self.peer_manager.get_managed_peers()
    }

    pub fn get_peer_state(&self, id: PeerIdentifier) -> Option<NodeAnnouncement> {
        self.gossip.get_peer_state(id)
    }

    pub fn get_all_peer_state(&self) -> HashMap<PeerIdentifier, NodeAnnouncement> {
        self.gossip.get_all_peer_state()
    }

    pub fn announce_now(&self) {
        self.gossip.announce_now();
    }

    pub fn browse_now(&self) {
        self.lan_discovery.browse_now();
    }

    pub fn path_snapshot(&self) -> HashMap<PeerIdentifier, PeerPathEntry> {
        self.path_tracker.snapshot()
    }

    pub fn path_gauge(&self) -> PathGauge {
        self.path_tracker.gauge()
    }

    pub fn current_reachability(&self) -> ReachabilitySnapshot {
        self.reachability.read().clone()
    }

    /// Dial a single peer outside of the reconnect loop's own schedule,
    /// e.g. for an operator-triggered "connect now".
    pub async fn dial(&self, peer: PeerIdentifier) -> Result<crate::path_dialer::DialOutcome, crate::path_dialer::DialError> {
        self.dialer.dial(peer.as_peer_id(), self.cancel.child_token()).await
    }
}

/// Feeds transport connectedness events to the Path Tracker. Kept
/// separate from the Peer Manager's own event worker: the tracker cares
/// about every connected peer, not only ones on the watchlist (a peer not
/// yet authorized can still appear transiently before the gater closes
/// the connection).
/// Spacing between RTT re-probes of every currently-tracked peer.
const RTT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

async fn path_tracker_worker<H: Host>(
    host: H,
    path_tracker: Arc<PathTracker<H>>,
    cancel: CancellationToken,
) {
    let mut events = host.subscribe_connectedness();
    let mut rtt_tick = tokio::time::interval(RTT_PROBE_INTERVAL);
    rtt_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = rtt_tick.tick() => {
                let peers: Vec<PeerIdentifier> = path_tracker.snapshot().into_keys().collect();
                for peer in peers {
                    path_tracker.probe_rtt(peer).await;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(crate::external::ConnectednessEvent::Connected(peer)) => {
                        path_tracker.on_connected(PeerIdentifier::from_peer_id(peer)).await;
                    }
                    Ok(crate::external::ConnectednessEvent::NotConnected(peer)) => {
                        path_tracker.on_disconnected(PeerIdentifier::from_peer_id(peer));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "path tracker event worker lagged behind connectedness events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Reacts to every [`NetworkChange`] with the four consumers named in
/// §4.3: re-probe, re-browse, backoff reset, immediate gossip.
#[allow(clippy::too_many_arguments)]
async fn network_change_worker<H: Host>(
    mut changes: tokio::sync::broadcast::Receiver<NetworkChange>,
    stun_config: crate::config::StunConfig,
    reachability: Arc<RwLock<ReachabilitySnapshot>>,
    peer_manager: Arc<PeerManager<H>>,
    lan_discovery: Arc<LanDiscovery<H>>,
    gossip: Arc<Gossip<H>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        debug!(?change, "reacting to network change");

                        let ifaces = match iface::enumerate().await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "interface enumeration failed during network-change reclassification");
                                continue;
                            }
                        };
                        let cgnat = ifaces.has_cgnat_address();
                        let stun_result = stun::probe(&stun_config, STUN_PROBE_BUDGET, cgnat).await.ok();
                        let grade = reachability::grade(&ifaces, stun_result.as_ref());
                        *reachability.write() = ReachabilitySnapshot { ifaces, stun: stun_result, grade };

                        lan_discovery.browse_now();
                        peer_manager.on_network_change();
                        gossip.announce_now();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "network change worker lagged behind monitor events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test_support::FakeTransport;

    struct FixedIdentity(PeerIdentifier);
    impl IdentityStore for FixedIdentity {
        fn local_peer_id(&self) -> PeerIdentifier {
            self.0
        }
    }

    #[tokio::test]
    async fn new_populates_self_id_from_identity_store() {
        let id = PeerIdentifier::random();
        let host = FakeTransport::new();
        let network = Network::new(
            Config::default(),
            host,
            &FixedIdentity(id),
            None,
            None,
            None,
            None,
            None,
        )
        .expect("valid config constructs a network");
        assert_eq!(network.self_id(), id);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let mut config = Config::default();
        config.gossip.fanout = 0;
        let host = FakeTransport::new();
        let result = Network::new(
            config,
            host,
            &FixedIdentity(PeerIdentifier::random()),
            None,
            None,
            None,
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_and_close_round_trip_cleanly() {
        let id = PeerIdentifier::random();
        let host = FakeTransport::new();
        let network = Network::new(
            Config::default(),
            host,
            &FixedIdentity(id),
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();

        network.start(AuthorizedSet::new(), Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        network.close().await;
    }
}
