//! LAN Discovery: advertise and browse a fixed mDNS-SD service type on the
//! local segment, upgrading relay-only connections to direct on a LAN hit.
//!
//! The wire codec in [`mdns_wire`] is a minimal DNS message encoder/decoder:
//! just enough PTR/TXT/A record support to carry `dnsaddr=<multiaddr>`
//! entries between instances of this same daemon. It does not implement
//! RFC 1035 name compression, since every participant on the wire is this
//! same implementation and compression is a size optimisation, not a
//! correctness requirement here.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use rand::Rng;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LanDiscoveryConfig;
use crate::external::{DialOpts, Host};
use crate::iface;
use crate::peer_id::PeerIdentifier;

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

#[derive(Debug, Error)]
pub enum LanDiscoveryError {
    #[error("failed to bind mdns socket: {0}")]
    SocketBind(std::io::Error),
    #[error("failed to join multicast group: {0}")]
    JoinMulticast(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer: PeerId,
    pub addresses: Vec<Multiaddr>,
}

pub struct LanDiscovery<H: Host> {
    config: LanDiscoveryConfig,
    self_id: PeerIdentifier,
    instance_name: String,
    host: Arc<H>,
    last_attempt: RwLock<HashMap<PeerId, Instant>>,
    dial_tokens: Arc<Semaphore>,
    browse_now: Notify,
}

impl<H: Host> LanDiscovery<H> {
    pub fn new(config: LanDiscoveryConfig, self_id: PeerIdentifier, host: Arc<H>) -> Self {
        let dial_concurrency = config.dial_concurrency;
        Self {
            instance_name: random_instance_name(),
            config,
            self_id,
            host,
            last_attempt: RwLock::new(HashMap::new()),
            dial_tokens: Arc::new(Semaphore::new(dial_concurrency)),
            browse_now: Notify::new(),
        }
    }

    /// Trigger an immediate browse round out of band.
    pub fn browse_now(&self) {
        self.browse_now.notify_one();
    }

    /// Run the advertiser and the browse loop until `cancel` fires.
    pub async fn run(self: &Arc<Self>, local_addrs: Vec<Multiaddr>, cancel: CancellationToken) {
        let advertiser = self.clone().run_advertiser(local_addrs, cancel.clone());
        let browser = self.clone().run_browse_loop(cancel);
        tokio::join!(advertiser, browser);
    }

    async fn run_advertiser(self: Arc<Self>, local_addrs: Vec<Multiaddr>, cancel: CancellationToken) {
        let lan_addrs = filter_to_lan_suitable(&local_addrs);
        let socket = match bind_multicast_listener() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "lan discovery advertiser could not bind, disabling advertisement");
                return;
            }
        };

        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Some(msg) = mdns_wire::Message::decode(&buf[..len]) {
                                if msg.questions.iter().any(|q| q.name == self.config.service_type) {
                                    self.respond(&socket, from, &lan_addrs).await;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "lan discovery advertiser recv failed"),
                    }
                }
            }
        }
    }

    async fn respond(&self, socket: &UdpSocket, to: SocketAddr, lan_addrs: &[Multiaddr]) {
        let response = build_response(&self.config.service_type, &self.instance_name, lan_addrs);
        let encoded = response.encode();
        if let Err(e) = socket.send_to(&encoded, to).await {
            debug!(error = %e, "lan discovery advertiser response send failed");
        }
    }

    async fn run_browse_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.round_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.browse_round().await,
                _ = self.browse_now.notified() => self.browse_round().await,
            }
        }
    }

    /// One bounded browse round: fresh multicast socket, send a query,
    /// collect responses until `round_duration` elapses.
    async fn browse_round(&self) {
        let socket = match bind_multicast_sender() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "lan discovery browse round could not bind socket");
                return;
            }
        };

        let query = mdns_wire::Message::query(&self.config.service_type);
        let dest = SocketAddr::new(IpAddr::V4(MULTICAST_ADDR), MDNS_PORT);
        if let Err(e) = socket.send_to(&query.encode(), dest).await {
            warn!(error = %e, "lan discovery query send failed");
            return;
        }

        let deadline = tokio::time::Instant::now() + self.config.round_duration;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let recv = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
            let Ok(Ok((len, _from))) = recv else {
                break;
            };
            if let Some(msg) = mdns_wire::Message::decode(&buf[..len]) {
                if let Some((peer, addrs)) = parse_peer_found(&self.config.service_type, &msg) {
                    self.handle_peer_found(peer, addrs).await;
                }
            }
        }
    }

    /// The eight-step contract for a discovered {peerId, addresses}.
    async fn handle_peer_found(&self, peer: PeerId, addresses: Vec<Multiaddr>) {
        // 1. Self-ignore.
        if peer == self.self_id.as_peer_id() {
            return;
        }

        // 2. Dedup within the last dedup_window.
        {
            let mut last = self.last_attempt.write();
            let now = Instant::now();
            if let Some(prev) = last.get(&peer) {
                if now.duration_since(*prev) < self.config.dedup_window {
                    return;
                }
            }
            last.insert(peer, now);
        }

        // 3. Filter to LAN-reachable addresses using the local interface
        // snapshot; fall back to the full set if none qualify.
        let local_nets = match iface::enumerate().await {
            Ok(summary) => summary.interfaces,
            Err(_) => Vec::new(),
        };
        let lan_only = filter_same_subnet(&addresses, &local_nets);
        let selected = if lan_only.is_empty() { addresses.clone() } else { lan_only };

        // 4. Add selected addresses with a 10 min TTL.
        self.host
            .add_addrs(peer, selected.clone(), self.config.address_ttl)
            .await;

        // 5. Detect upgrade: connected but every connection relay-limited.
        let conns = self.host.conns_to_peer(peer).await;
        let is_upgrade = !conns.is_empty() && conns.iter().all(|c| c.limited);

        // 6. Acquire a dial token without blocking.
        let Ok(permit) = self.dial_tokens.clone().try_acquire_owned() else {
            debug!(%peer, "lan discovery dial tokens exhausted, skipping");
            return;
        };

        // 7. Dial with a bounded timeout, annotated force-direct for an
        // upgrade so the transport opens a new direct path alongside the
        // existing relay connection instead of treating the peer as
        // already connected.
        let dial_opts = if is_upgrade { DialOpts::force_direct() } else { DialOpts::default() };
        let dial_result = tokio::time::timeout(self.config.dial_timeout, self.dial_any(peer, &selected, dial_opts)).await;
        drop(permit);

        if !matches!(dial_result, Ok(true)) {
            return;
        }

        // 8. On success, add the full address set and sweep relay
        // connections.
        self.host
            .add_addrs(peer, addresses, self.config.address_ttl)
            .await;
        spawn_relay_sweep(self.host.clone(), peer, self.config.post_upgrade_sweep_window, self.config.post_upgrade_sweep_interval);
    }

    async fn dial_any(&self, peer: PeerId, addrs: &[Multiaddr], opts: DialOpts) -> bool {
        for addr in addrs {
            if self.host.connect(addr, opts).await.is_ok() {
                return true;
            }
        }
        let _ = peer;
        false
    }
}

fn spawn_relay_sweep<H: Host>(host: Arc<H>, peer: PeerId, window: Duration, interval: Duration) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let conns = host.conns_to_peer(peer).await;
            for conn in conns.into_iter().filter(|c| c.limited) {
                debug!(%peer, addr = %conn.remote_multiaddr, "sweeping relay-limited connection after lan upgrade");
                if let Err(e) = host.close_connection(peer, &conn.remote_multiaddr).await {
                    debug!(%peer, error = %e, "relay sweep close_connection failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    });
}

fn random_instance_name() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    hex::encode(bytes)
}

/// Keep only addresses suitable for LAN reach: direct IP families, no
/// circuit-relay hop, no browser-only transports.
fn filter_to_lan_suitable(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|a| !crate::multiaddr::is_relayed(a))
        .filter(|a| {
            a.iter()
                .any(|p| matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_)))
        })
        .cloned()
        .collect()
}

fn filter_same_subnet(addrs: &[Multiaddr], local_nets: &[IpNet]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|addr| {
            addr.iter().any(|p| match p {
                Protocol::Ip4(ip) => local_nets.iter().any(|net| net.contains(&IpAddr::V4(ip))),
                Protocol::Ip6(ip) => local_nets.iter().any(|net| net.contains(&IpAddr::V6(ip))),
                _ => false,
            })
        })
        .cloned()
        .collect()
}

fn build_response(service_type: &str, instance_name: &str, lan_addrs: &[Multiaddr]) -> mdns_wire::Message {
    let instance = format!("{instance_name}.{service_type}");
    let txt_strings: Vec<String> = lan_addrs.iter().map(|a| format!("dnsaddr={a}")).collect();
    mdns_wire::Message::response(service_type, &instance, &txt_strings)
}

fn parse_peer_found(service_type: &str, msg: &mdns_wire::Message) -> Option<(PeerId, Vec<Multiaddr>)> {
    if !msg.is_response {
        return None;
    }
    let txt = msg
        .answers
        .iter()
        .find(|rr| rr.rtype == mdns_wire::TYPE_TXT && rr.name.ends_with(service_type))?;
    let strings = mdns_wire::decode_txt(&txt.rdata);

    let mut addrs = Vec::new();
    for s in strings {
        if let Some(text) = s.strip_prefix("dnsaddr=") {
            if let Ok(addr) = text.parse::<Multiaddr>() {
                addrs.push(addr);
            }
        }
    }
    let peer = addrs.iter().find_map(crate::multiaddr::terminal_peer)?;
    Some((peer, addrs))
}

fn bind_multicast_listener() -> Result<UdpSocket, LanDiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(LanDiscoveryError::SocketBind)?;
    socket.set_reuse_address(true).map_err(LanDiscoveryError::SocketBind)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true).map_err(LanDiscoveryError::SocketBind)?;
    socket.set_nonblocking(true).map_err(LanDiscoveryError::SocketBind)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    socket.bind(&socket2::SockAddr::from(bind_addr)).map_err(LanDiscoveryError::SocketBind)?;
    socket
        .join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)
        .map_err(LanDiscoveryError::JoinMulticast)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(LanDiscoveryError::SocketBind)
}

fn bind_multicast_sender() -> Result<UdpSocket, LanDiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(LanDiscoveryError::SocketBind)?;
    socket.set_reuse_address(true).map_err(LanDiscoveryError::SocketBind)?;
    socket.set_nonblocking(true).map_err(LanDiscoveryError::SocketBind)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&socket2::SockAddr::from(bind_addr)).map_err(LanDiscoveryError::SocketBind)?;
    socket
        .join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)
        .map_err(LanDiscoveryError::JoinMulticast)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(LanDiscoveryError::SocketBind)
}

/// A minimal DNS message codec: just enough to carry a PTR query and a
/// PTR+TXT(+A) response between our own instances. No name compression.
mod mdns_wire {
    pub const TYPE_A: u16 = 1;
    pub const TYPE_PTR: u16 = 12;
    pub const TYPE_TXT: u16 = 16;
    const CLASS_IN: u16 = 1;

    #[derive(Debug, Clone)]
    pub struct Question {
        pub name: String,
        pub qtype: u16,
    }

    #[derive(Debug, Clone)]
    pub struct ResourceRecord {
        pub name: String,
        pub rtype: u16,
        pub rdata: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    pub struct Message {
        pub is_response: bool,
        pub questions: Vec<Question>,
        pub answers: Vec<ResourceRecord>,
    }

    impl Message {
        pub fn query(service_type: &str) -> Self {
            Self {
                is_response: false,
                questions: vec![Question {
                    name: service_type.to_string(),
                    qtype: TYPE_PTR,
                }],
                answers: Vec::new(),
            }
        }

        pub fn response(service_type: &str, instance: &str, txt_strings: &[String]) -> Self {
            let ptr = ResourceRecord {
                name: service_type.to_string(),
                rtype: TYPE_PTR,
                rdata: encode_name(instance),
            };
            let txt = ResourceRecord {
                name: instance.to_string(),
                rtype: TYPE_TXT,
                rdata: encode_txt(txt_strings),
            };
            // Advisory A record; addressing authority is in the TXT records.
            let a = ResourceRecord {
                name: instance.to_string(),
                rtype: TYPE_A,
                rdata: vec![0, 0, 0, 0],
            };
            Self {
                is_response: true,
                questions: Vec::new(),
                answers: vec![ptr, txt, a],
            }
        }

        pub fn encode(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&0u16.to_be_bytes()); // transaction id, unused
            let flags: u16 = if self.is_response { 0x8400 } else { 0x0000 };
            buf.extend_from_slice(&flags.to_be_bytes());
            buf.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
            buf.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
            buf.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

            for q in &self.questions {
                buf.extend_from_slice(&encode_name(&q.name));
                buf.extend_from_slice(&q.qtype.to_be_bytes());
                buf.extend_from_slice(&CLASS_IN.to_be_bytes());
            }
            for rr in &self.answers {
                buf.extend_from_slice(&encode_name(&rr.name));
                buf.extend_from_slice(&rr.rtype.to_be_bytes());
                buf.extend_from_slice(&CLASS_IN.to_be_bytes());
                buf.extend_from_slice(&120u32.to_be_bytes()); // TTL seconds
                buf.extend_from_slice(&(rr.rdata.len() as u16).to_be_bytes());
                buf.extend_from_slice(&rr.rdata);
            }
            buf
        }

        pub fn decode(buf: &[u8]) -> Option<Message> {
            if buf.len() < 12 {
                return None;
            }
            let flags = u16::from_be_bytes([buf[2], buf[3]]);
            let is_response = flags & 0x8000 != 0;
            let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;

            let mut offset = 12;
            let mut questions = Vec::with_capacity(qdcount);
            for _ in 0..qdcount {
                let (name, next) = decode_name(buf, offset)?;
                if next + 4 > buf.len() {
                    return None;
                }
                let qtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
                questions.push(Question { name, qtype });
                offset = next + 4;
            }

            let mut answers = Vec::with_capacity(ancount);
            for _ in 0..ancount {
                let (name, next) = decode_name(buf, offset)?;
                if next + 10 > buf.len() {
                    return None;
                }
                let rtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
                let rdlength = u16::from_be_bytes([buf[next + 8], buf[next + 9]]) as usize;
                let rdata_start = next + 10;
                let rdata_end = rdata_start + rdlength;
                if rdata_end > buf.len() {
                    return None;
                }
                answers.push(ResourceRecord {
                    name,
                    rtype,
                    rdata: buf[rdata_start..rdata_end].to_vec(),
                });
                offset = rdata_end;
            }

            Some(Message {
                is_response,
                questions,
                answers,
            })
        }
    }

    fn encode_name(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        for label in name.trim_end_matches('.').split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf
    }

    fn decode_name(buf: &[u8], mut offset: usize) -> Option<(String, usize)> {
        let mut labels = Vec::new();
        loop {
            let len = *buf.get(offset)? as usize;
            if len == 0 {
                offset += 1;
                break;
            }
            offset += 1;
            let label = buf.get(offset..offset + len)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            offset += len;
        }
        Some((format!("{}.", labels.join(".")), offset))
    }

    fn encode_txt(strings: &[String]) -> Vec<u8> {
        let mut buf = Vec::new();
        for s in strings {
            let bytes = s.as_bytes();
            let len = bytes.len().min(255);
            buf.push(len as u8);
            buf.extend_from_slice(&bytes[..len]);
        }
        buf
    }

    pub fn decode_txt(rdata: &[u8]) -> Vec<String> {
        let mut strings = Vec::new();
        let mut offset = 0;
        while offset < rdata.len() {
            let len = rdata[offset] as usize;
            offset += 1;
            if offset + len > rdata.len() {
                break;
            }
            strings.push(String::from_utf8_lossy(&rdata[offset..offset + len]).into_owned());
            offset += len;
        }
        strings
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn query_roundtrips_through_encode_decode() {
            let query = Message::query("_overlay._udp.local.");
            let encoded = query.encode();
            let decoded = Message::decode(&encoded).unwrap();
            assert!(!decoded.is_response);
            assert_eq!(decoded.questions.len(), 1);
            assert_eq!(decoded.questions[0].qtype, TYPE_PTR);
        }

        #[test]
        fn response_carries_txt_dnsaddr_entries() {
            let txt = vec!["dnsaddr=/ip4/192.168.1.5/tcp/4001".to_string()];
            let response = Message::response("_overlay._udp.local.", "abcd1234._overlay._udp.local.", &txt);
            let encoded = response.encode();
            let decoded = Message::decode(&encoded).unwrap();
            assert!(decoded.is_response);
            let txt_rr = decoded.answers.iter().find(|rr| rr.rtype == TYPE_TXT).unwrap();
            let strings = decode_txt(&txt_rr.rdata);
            assert_eq!(strings, txt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test_support::FakeTransport;

    #[tokio::test]
    async fn self_discovery_is_ignored() {
        let self_id = PeerIdentifier::random();
        let host = Arc::new(FakeTransport::new());
        let discovery = Arc::new(LanDiscovery::new(LanDiscoveryConfig::default(), self_id, host));
        discovery.handle_peer_found(self_id.as_peer_id(), vec![]).await;
        assert!(discovery.last_attempt.read().is_empty());
    }

    #[tokio::test]
    async fn repeated_discovery_within_dedup_window_is_skipped() {
        let self_id = PeerIdentifier::random();
        let other = PeerIdentifier::random();
        let host = Arc::new(FakeTransport::new());
        let discovery = Arc::new(LanDiscovery::new(LanDiscoveryConfig::default(), self_id, host));

        discovery.handle_peer_found(other.as_peer_id(), vec![]).await;
        let first_seen = *discovery.last_attempt.read().get(&other.as_peer_id()).unwrap();

        discovery.handle_peer_found(other.as_peer_id(), vec![]).await;
        let second_seen = *discovery.last_attempt.read().get(&other.as_peer_id()).unwrap();

        assert_eq!(first_seen, second_seen, "second call within dedup window must not update last_attempt");
    }

    #[test]
    fn filter_to_lan_suitable_drops_relayed_addresses() {
        let target = PeerId::random();
        let relayed: Multiaddr = format!(
            "/ip4/1.2.3.4/tcp/1/p2p/{}/p2p-circuit/p2p/{target}",
            PeerId::random()
        )
        .parse()
        .unwrap();
        let direct: Multiaddr = "/ip4/192.168.1.5/tcp/4001".parse().unwrap();
        let filtered = filter_to_lan_suitable(&[relayed, direct.clone()]);
        assert_eq!(filtered, vec![direct]);
    }
}
