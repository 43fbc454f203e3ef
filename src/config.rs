//! Tunable knobs for every component in the connectivity core.
//!
//! `Config` is `Deserialize` so the external CLI/YAML layer can populate it;
//! the core itself never reads a file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::OverlayError;

/// Peer Manager timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerManagerConfig {
    /// Reconnect worker tick.
    pub reconnect_interval: Duration,
    /// Bounded concurrency for the reconnect worker.
    pub reconnect_concurrency: usize,
    /// Base backoff duration, doubled on each consecutive failure up to the
    /// ceiling below.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Probe worker tick.
    pub probe_interval: Duration,
    /// Cooldown granted after a relay->direct upgrade.
    pub probe_cooldown: Duration,
    /// Raw TCP handshake timeout used by the probe worker.
    pub probe_handshake_timeout: Duration,
    /// Force-direct dial timeout after a successful handshake.
    pub probe_dial_timeout: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            reconnect_concurrency: 3,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(15 * 60),
            probe_interval: Duration::from_secs(2 * 60),
            probe_cooldown: Duration::from_secs(90),
            probe_handshake_timeout: Duration::from_secs(3),
            probe_dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Path Dialer timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    pub dht_find_peer_timeout: Duration,
    pub dht_connect_timeout: Duration,
    pub relay_connect_timeout: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            dht_find_peer_timeout: Duration::from_secs(15),
            dht_connect_timeout: Duration::from_secs(15),
            relay_connect_timeout: Duration::from_secs(30),
        }
    }
}

/// LAN Discovery timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanDiscoveryConfig {
    /// Fixed mDNS-SD service type, e.g. "_overlay._udp".
    pub service_type: String,
    /// Each browse round lasts up to this long.
    pub round_duration: Duration,
    /// Spacing between browse rounds.
    pub round_interval: Duration,
    /// Dedup window for repeated peer-found handling on the same peer.
    pub dedup_window: Duration,
    /// Address-book TTL granted to discovered addresses.
    pub address_ttl: Duration,
    /// Concurrent dial token pool.
    pub dial_concurrency: usize,
    /// Per-dial timeout.
    pub dial_timeout: Duration,
    /// How long, and how often, to sweep relay-limited connections after a
    /// direct upgrade.
    pub post_upgrade_sweep_window: Duration,
    pub post_upgrade_sweep_interval: Duration,
}

impl Default for LanDiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_overlay._udp.local.".to_string(),
            round_duration: Duration::from_secs(10),
            round_interval: Duration::from_secs(30),
            dedup_window: Duration::from_secs(30),
            address_ttl: Duration::from_secs(10 * 60),
            dial_concurrency: 5,
            dial_timeout: Duration::from_secs(5),
            post_upgrade_sweep_window: Duration::from_secs(90),
            post_upgrade_sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Network Monitor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMonitorConfig {
    pub debounce: Duration,
    /// Poll interval used on platforms with no native route/netlink events.
    pub poll_interval: Duration,
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// STUN Prober timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    pub servers: Vec<String>,
    /// Per-server probe timeout ceiling, or the call deadline if sooner.
    pub per_probe_timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun2.l.google.com:19302".to_string(),
            ],
            per_probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Presence Gossip timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Publish interval.
    pub announce_interval: Duration,
    /// Per-stream deadline for both publish and receive.
    pub stream_deadline: Duration,
    /// Maximum forward depth.
    pub max_hops: u32,
    /// Forward fanout.
    pub fanout: usize,
    /// Eviction sweep tick.
    pub eviction_interval: Duration,
    /// Cap on wire-encoded announcement size.
    pub max_announcement_bytes: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5 * 60),
            stream_deadline: Duration::from_secs(10),
            max_hops: 3,
            fanout: 3,
            eviction_interval: Duration::from_secs(60),
            max_announcement_bytes: 4096,
        }
    }
}

/// Top-level configuration for the connectivity core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub peer_manager: PeerManagerConfig,
    pub dialer: DialerConfig,
    pub lan_discovery: LanDiscoveryConfig,
    pub network_monitor: NetworkMonitorConfig,
    pub stun: StunConfig,
    pub gossip: GossipConfig,
    /// Static relay multiaddresses, e.g. `/dns4/relay.example.com/tcp/4001`.
    pub relay_addresses: Vec<String>,
}

impl Config {
    /// Reject configuration a constructor should never accept silently.
    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.peer_manager.reconnect_concurrency == 0 {
            return Err(OverlayError::InvalidConfig(
                "peer_manager.reconnect_concurrency must be > 0".into(),
            ));
        }
        if self.lan_discovery.dial_concurrency == 0 {
            return Err(OverlayError::InvalidConfig(
                "lan_discovery.dial_concurrency must be > 0".into(),
            ));
        }
        if self.gossip.fanout == 0 {
            return Err(OverlayError::InvalidConfig(
                "gossip.fanout must be > 0".into(),
            ));
        }
        if self.lan_discovery.service_type.is_empty() {
            return Err(OverlayError::InvalidConfig(
                "lan_discovery.service_type must not be empty".into(),
            ));
        }
        for addr in &self.relay_addresses {
            addr.parse::<libp2p::Multiaddr>().map_err(|e| {
                OverlayError::InvalidConfig(format!("invalid relay address {addr:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn zero_reconnect_concurrency_rejected() {
        let mut cfg = Config::default();
        cfg.peer_manager.reconnect_concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_fanout_rejected() {
        let mut cfg = Config::default();
        cfg.gossip.fanout = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_relay_address_rejected() {
        let mut cfg = Config::default();
        cfg.relay_addresses.push("not-a-multiaddr".to_string());
        assert!(cfg.validate().is_err());
    }
}
