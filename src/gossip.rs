//! Presence Gossip (NetIntel): direct push plus bounded flood of
//! self-describing node announcements, with a monotonic-per-originator
//! cache and lazy eviction.
//!
//! The handler in [`Gossip::handle_payload`] is the single entry point for
//! an announcement payload regardless of which channel delivered it;
//! [`Gossip::handle_stream`] is one such channel (a libp2p-style duplex
//! stream), but a future pub/sub transport would call `handle_payload`
//! directly with the same effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use libp2p::PeerId;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GossipConfig;
use crate::external::{BoxedStream, ConnectionGater, GossipStateProvider, Host};
use crate::peer_id::PeerIdentifier;
use crate::reachability::Grade;
use crate::stun::NatFamily;

const PROTOCOL_VERSION: u32 = 1;
pub const PRESENCE_PROTOCOL: &str = "/presence/1.0.0";

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("announcement exceeds the size cap")]
    Oversize,
    #[error("failed to decode announcement: {0}")]
    Decode(String),
    #[error("unsupported announcement version {0}")]
    UnsupportedVersion(u32),
    #[error("originator identifier invalid")]
    InvalidOriginator,
    #[error("announcement originated from self")]
    SelfOriginated,
    #[error("originator rejected by peer filter")]
    Filtered,
    #[error("stream read failed: {0}")]
    StreamRead(String),
    #[error("stream write failed: {0}")]
    StreamWrite(String),
}

/// A self-describing, versioned record describing one node's reachability
/// state. Carries no private addresses or peer lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub v: u32,
    pub from: PeerIdentifier,
    pub grade: Grade,
    pub nat_type: NatFamily,
    pub ipv4: bool,
    pub ipv6: bool,
    pub cgnat: bool,
    pub uptime_sec: u64,
    pub peer_count: u32,
    pub ts: u64,
    pub hops: u32,
}

/// A source of the currently-connected peer set, as tracked by the Peer
/// Manager. A narrow internal seam so Gossip does not need to depend on
/// `PeerManager<H>`'s transport type parameter.
pub trait ConnectedPeerSource: Send + Sync + 'static {
    fn connected_peers(&self) -> Vec<PeerIdentifier>;
}

struct CacheEntry {
    announcement: NodeAnnouncement,
    arrived_at: Instant,
}

pub struct Gossip<H: Host> {
    config: GossipConfig,
    self_id: PeerIdentifier,
    host: Arc<H>,
    state_provider: Arc<dyn GossipStateProvider>,
    connected_peers: Arc<dyn ConnectedPeerSource>,
    peer_filter: Option<Arc<dyn ConnectionGater>>,
    cache: RwLock<HashMap<PeerIdentifier, CacheEntry>>,
    announce_now: tokio::sync::Notify,
}

impl<H: Host> Gossip<H> {
    pub fn new(
        config: GossipConfig,
        self_id: PeerIdentifier,
        host: Arc<H>,
        state_provider: Arc<dyn GossipStateProvider>,
        connected_peers: Arc<dyn ConnectedPeerSource>,
        peer_filter: Option<Arc<dyn ConnectionGater>>,
    ) -> Self {
        Self {
            config,
            self_id,
            host,
            state_provider,
            connected_peers,
            peer_filter,
            cache: RwLock::new(HashMap::new()),
            announce_now: tokio::sync::Notify::new(),
        }
    }

    /// Idempotent nudge: coalesces with any already-pending wakeup rather
    /// than queuing a second publish.
    pub fn announce_now(&self) {
        self.announce_now.notify_one();
    }

    pub fn get_peer_state(&self, id: PeerIdentifier) -> Option<NodeAnnouncement> {
        self.cache.read().get(&id).map(|e| e.announcement.clone())
    }

    pub fn get_all_peer_state(&self) -> HashMap<PeerIdentifier, NodeAnnouncement> {
        self.cache
            .read()
            .iter()
            .map(|(id, e)| (*id, e.announcement.clone()))
            .collect()
    }

    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let publisher = self.clone().publisher_worker(cancel.clone());
        let eviction = self.clone().eviction_worker(cancel);
        tokio::join!(publisher, eviction);
    }

    async fn publisher_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.announce_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.publish().await,
                _ = self.announce_now.notified() => self.publish().await,
            }
        }
    }

    async fn eviction_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.eviction_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.evict_stale(),
            }
        }
    }

    fn evict_stale(&self) {
        let max_age = self.config.announce_interval * 2;
        let now = Instant::now();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| now.duration_since(entry.arrived_at) < max_age);
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(evicted, "gossip cache eviction swept stale entries");
        }
    }

    async fn publish(&self) {
        let mut announcement = self.state_provider.build_announcement();
        announcement.v = PROTOCOL_VERSION;
        announcement.from = self.self_id;
        announcement.hops = 0;
        announcement.ts = unix_now();

        let payload = match encode(&announcement, self.config.max_announcement_bytes) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(error = %e, "refusing to publish oversize announcement");
                return;
            }
        };

        let targets = self.eligible_targets(&[]);
        for peer in targets {
            let host = self.host.clone();
            let payload = payload.clone();
            let deadline = self.config.stream_deadline;
            tokio::spawn(async move {
                if let Err(e) = send_payload(&*host, peer, &payload, deadline).await {
                    debug!(%peer, error = %e, "presence push failed");
                }
            });
        }
    }

    /// On an incoming presence stream: read with a deadline and a size
    /// cap, then hand the payload to [`Self::handle_payload`].
    pub async fn handle_stream(self: &Arc<Self>, sender: PeerId, mut stream: BoxedStream) {
        let bytes = match read_capped(&mut stream, self.config.max_announcement_bytes, self.config.stream_deadline).await {
            Ok(b) => b,
            Err(e) => {
                debug!(%sender, error = %e, "presence stream read failed");
                return;
            }
        };
        if let Err(e) = self.handle_payload(sender, &bytes).await {
            debug!(%sender, error = %e, "presence announcement dropped");
        }
    }

    /// Single entry point for an announcement payload, independent of the
    /// channel it arrived on.
    async fn handle_payload(self: &Arc<Self>, sender: PeerId, bytes: &[u8]) -> Result<(), GossipError> {
        if bytes.len() > self.config.max_announcement_bytes {
            return Err(GossipError::Oversize);
        }
        let mut announcement: NodeAnnouncement =
            serde_json::from_slice(bytes).map_err(|e| GossipError::Decode(e.to_string()))?;
        if announcement.v != PROTOCOL_VERSION {
            return Err(GossipError::UnsupportedVersion(announcement.v));
        }

        let originator = if announcement.hops == 0 {
            let asserted = PeerIdentifier::from_peer_id(sender);
            announcement.from = asserted;
            asserted
        } else {
            announcement.from
        };

        if originator == self.self_id {
            return Err(GossipError::SelfOriginated);
        }
        if let Some(filter) = &self.peer_filter {
            if !filter.is_authorized(&originator) {
                return Err(GossipError::Filtered);
            }
        }

        let is_new = {
            let mut cache = self.cache.write();
            match cache.get(&originator) {
                Some(existing) if existing.announcement.ts >= announcement.ts => false,
                _ => {
                    cache.insert(
                        originator,
                        CacheEntry {
                            announcement: announcement.clone(),
                            arrived_at: Instant::now(),
                        },
                    );
                    true
                }
            }
        };

        if is_new && announcement.hops < self.config.max_hops {
            self.forward(sender, originator, announcement);
        }
        Ok(())
    }

    fn forward(self: &Arc<Self>, sender: PeerId, originator: PeerIdentifier, mut announcement: NodeAnnouncement) {
        announcement.hops += 1;
        let exclude = [PeerIdentifier::from_peer_id(sender), originator];
        let mut candidates = self.eligible_targets(&exclude);
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(self.config.fanout);

        let payload = match encode(&announcement, self.config.max_announcement_bytes) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(error = %e, "refusing to forward oversize announcement");
                return;
            }
        };

        for peer in candidates {
            let host = self.host.clone();
            let payload = payload.clone();
            let deadline = self.config.stream_deadline;
            tokio::spawn(async move {
                if let Err(e) = send_payload(&*host, peer, &payload, deadline).await {
                    debug!(%peer, error = %e, "presence forward failed");
                }
            });
        }
    }

    /// Currently-connected peers minus self and `exclude`, filtered by the
    /// peer filter.
    fn eligible_targets(&self, exclude: &[PeerIdentifier]) -> Vec<PeerId> {
        self.connected_peers
            .connected_peers()
            .into_iter()
            .filter(|id| *id != self.self_id)
            .filter(|id| !exclude.contains(id))
            .filter(|id| {
                self.peer_filter
                    .as_ref()
                    .map(|f| f.is_authorized(id))
                    .unwrap_or(true)
            })
            .map(|id| id.as_peer_id())
            .collect()
    }
}

async fn send_payload<H: Host + ?Sized>(
    host: &H,
    peer: PeerId,
    payload: &[u8],
    deadline: Duration,
) -> Result<(), GossipError> {
    let fut = async {
        let mut stream = host
            .new_stream(peer, PRESENCE_PROTOCOL)
            .await
            .map_err(|e| GossipError::StreamWrite(e.to_string()))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| GossipError::StreamWrite(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| GossipError::StreamWrite(e.to_string()))?;
        Ok(())
    };
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| GossipError::StreamWrite("deadline exceeded".into()))?
}

async fn read_capped(stream: &mut BoxedStream, cap: usize, deadline: Duration) -> Result<Vec<u8>, GossipError> {
    let fut = async {
        let mut buf = vec![0u8; cap + 1];
        let mut len = 0usize;
        loop {
            let n = stream
                .read(&mut buf[len..])
                .await
                .map_err(|e| GossipError::StreamRead(e.to_string()))?;
            if n == 0 {
                break;
            }
            len += n;
            if len > cap {
                return Err(GossipError::Oversize);
            }
        }
        Ok(buf[..len].to_vec())
    };
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| GossipError::StreamRead("deadline exceeded".into()))?
}

fn encode(announcement: &NodeAnnouncement, cap: usize) -> Result<Vec<u8>, GossipError> {
    let bytes = serde_json::to_vec(announcement).map_err(|e| GossipError::Decode(e.to_string()))?;
    if bytes.len() > cap {
        return Err(GossipError::Oversize);
    }
    Ok(bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test_support::FakeTransport;

    fn sample(from: PeerIdentifier, hops: u32, ts: u64) -> NodeAnnouncement {
        NodeAnnouncement {
            v: PROTOCOL_VERSION,
            from,
            grade: Grade::B,
            nat_type: NatFamily::Unknown,
            ipv4: true,
            ipv6: false,
            cgnat: false,
            uptime_sec: 10,
            peer_count: 2,
            ts,
            hops,
        }
    }

    struct NoPeers;
    impl ConnectedPeerSource for NoPeers {
        fn connected_peers(&self) -> Vec<PeerIdentifier> {
            Vec::new()
        }
    }

    struct StaticAnnouncement(NodeAnnouncement);
    impl GossipStateProvider for StaticAnnouncement {
        fn build_announcement(&self) -> NodeAnnouncement {
            self.0.clone()
        }
    }

    fn gossip_with_cache() -> Arc<Gossip<FakeTransport>> {
        let self_id = PeerIdentifier::random();
        let host = Arc::new(FakeTransport::new());
        let provider = Arc::new(StaticAnnouncement(sample(self_id, 0, 0)));
        Arc::new(Gossip::new(
            GossipConfig::default(),
            self_id,
            host,
            provider,
            Arc::new(NoPeers),
            None,
        ))
    }

    #[tokio::test]
    async fn self_originated_announcement_is_dropped() {
        let gossip = gossip_with_cache();
        let bytes = serde_json::to_vec(&sample(gossip.self_id, 1, unix_now())).unwrap();
        let result = gossip.handle_payload(gossip.self_id.as_peer_id(), &bytes).await;
        assert!(matches!(result, Err(GossipError::SelfOriginated)));
        assert!(gossip.get_all_peer_state().is_empty());
    }

    #[tokio::test]
    async fn newer_timestamp_replaces_cached_entry() {
        let gossip = gossip_with_cache();
        let origin = PeerIdentifier::random();
        let sender = origin.as_peer_id();

        let first = serde_json::to_vec(&sample(origin, 0, 100)).unwrap();
        gossip.handle_payload(sender, &first).await.unwrap();
        assert_eq!(gossip.get_peer_state(origin).unwrap().ts, 100);

        let stale = serde_json::to_vec(&sample(origin, 0, 50)).unwrap();
        gossip.handle_payload(sender, &stale).await.unwrap();
        assert_eq!(gossip.get_peer_state(origin).unwrap().ts, 100);

        let fresh = serde_json::to_vec(&sample(origin, 0, 200)).unwrap();
        gossip.handle_payload(sender, &fresh).await.unwrap();
        assert_eq!(gossip.get_peer_state(origin).unwrap().ts, 200);
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let gossip = gossip_with_cache();
        let origin = PeerIdentifier::random();
        let mut announcement = sample(origin, 0, unix_now());
        announcement.v = 99;
        let bytes = serde_json::to_vec(&announcement).unwrap();
        let result = gossip.handle_payload(origin.as_peer_id(), &bytes).await;
        assert!(matches!(result, Err(GossipError::UnsupportedVersion(99))));
    }

    #[test]
    fn oversize_payload_rejected_by_encode() {
        let origin = PeerIdentifier::random();
        let announcement = sample(origin, 0, 1);
        assert!(encode(&announcement, 4).is_err());
    }

    #[test]
    fn decode_is_identity_on_recognised_fields_and_drops_unknown_ones() {
        let origin = PeerIdentifier::random();
        let announcement = sample(origin, 1, 12345);
        let mut value = serde_json::to_value(&announcement).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("future_field".to_string(), serde_json::json!("unused"));
        let bytes = serde_json::to_vec(&value).unwrap();

        let decoded: NodeAnnouncement = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.v, announcement.v);
        assert_eq!(decoded.from, announcement.from);
        assert_eq!(decoded.grade, announcement.grade);
        assert_eq!(decoded.nat_type, announcement.nat_type);
        assert_eq!(decoded.ipv4, announcement.ipv4);
        assert_eq!(decoded.ipv6, announcement.ipv6);
        assert_eq!(decoded.cgnat, announcement.cgnat);
        assert_eq!(decoded.uptime_sec, announcement.uptime_sec);
        assert_eq!(decoded.peer_count, announcement.peer_count);
        assert_eq!(decoded.ts, announcement.ts);
        assert_eq!(decoded.hops, announcement.hops);
    }
}
