//! Interface Inventory: enumerate local interfaces and classify their
//! addresses as loopback / link-local / private / CGNAT / global-unicast /
//! ULA, per RFC 1918, RFC 6598, and RFC 4193 boundaries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use futures::StreamExt;
use if_watch::tokio::IfWatcher;
use if_watch::IfEvent;
use ipnet::IpNet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("failed to open interface watcher: {0}")]
    WatcherInit(std::io::Error),
    #[error("interface watcher stream error: {0}")]
    WatcherStream(std::io::Error),
}

/// Snapshot of locally-known, up, non-discarded interface networks, split
/// into globally routable IPv4 and IPv6 addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub interfaces: Vec<IpNet>,
    pub global_v4: Vec<Ipv4Addr>,
    pub global_v6: Vec<Ipv6Addr>,
}

impl InterfaceSummary {
    pub fn has_global_ipv4(&self) -> bool {
        !self.global_v4.is_empty()
    }

    pub fn has_global_ipv6(&self) -> bool {
        !self.global_v6.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// True iff any local interface carries an RFC 6598 CGNAT address,
    /// regardless of whether it also has a global address elsewhere. Feeds
    /// the Reachability Classifier's CGNAT cap.
    pub fn has_cgnat_address(&self) -> bool {
        self.interfaces.iter().any(|net| match net.addr() {
            IpAddr::V4(v4) => is_cgnat_v4(v4),
            IpAddr::V6(_) => false,
        })
    }
}

/// How long `enumerate()` waits for the watcher's initial burst of `Up`
/// events to settle before treating the snapshot as complete.
const DRAIN_QUIESCENCE: Duration = Duration::from_millis(100);

/// Enumerate up, non-discarded interfaces and classify their addresses.
/// Pure function of OS state at call time: a fresh watcher is opened,
/// drained until quiescent, and dropped.
pub async fn enumerate() -> Result<InterfaceSummary, IfaceError> {
    let mut watcher = IfWatcher::new().map_err(IfaceError::WatcherInit)?;
    let mut nets = Vec::new();

    loop {
        match tokio::time::timeout(DRAIN_QUIESCENCE, watcher.next()).await {
            Ok(Some(Ok(IfEvent::Up(net)))) => nets.push(net),
            Ok(Some(Ok(IfEvent::Down(_)))) => {}
            Ok(Some(Err(e))) => return Err(IfaceError::WatcherStream(e)),
            Ok(None) => break,
            Err(_elapsed) => break,
        }
    }

    let mut summary = InterfaceSummary {
        interfaces: nets.clone(),
        ..Default::default()
    };

    for net in &nets {
        match net.addr() {
            IpAddr::V4(v4) => {
                if is_global_unicast_v4(v4) {
                    summary.global_v4.push(v4);
                }
            }
            IpAddr::V6(v6) => {
                if is_global_unicast_v6(v6) {
                    summary.global_v6.push(v6);
                }
            }
        }
    }

    summary.global_v4.sort();
    summary.global_v4.dedup();
    summary.global_v6.sort();
    summary.global_v6.dedup();
    summary.interfaces.sort_by_key(|n| n.to_string());

    if summary.is_empty() {
        warn!("interface enumeration produced no up interfaces");
    }

    Ok(summary)
}

/// Global-unicast IPv4 predicate: rejects RFC 1918 private ranges, RFC 6598
/// CGNAT, link-local, and loopback.
pub fn is_global_unicast_v4(addr: Ipv4Addr) -> bool {
    if addr.is_loopback() || addr.is_link_local() || addr.is_private() {
        return false;
    }
    if is_cgnat_v4(addr) {
        return false;
    }
    if addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() {
        return false;
    }
    true
}

/// RFC 6598: 100.64.0.0/10.
fn is_cgnat_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

/// Global-unicast IPv6 predicate: rejects ULA (fc00::/7), link-local
/// (fe80::/10), and loopback.
pub fn is_global_unicast_v6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() || addr.is_multicast() {
        return false;
    }
    if is_unique_local_v6(addr) {
        return false;
    }
    if is_link_local_v6(addr) {
        return false;
    }
    true
}

/// fc00::/7
fn is_unique_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1918_ranges_rejected() {
        assert!(!is_global_unicast_v4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(192, 168, 0, 1)));
    }

    #[test]
    fn cgnat_and_link_local_and_loopback_rejected() {
        assert!(!is_global_unicast_v4(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!is_global_unicast_v4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn known_global_addresses_accepted() {
        assert!(is_global_unicast_v4(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(is_global_unicast_v4(Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn cgnat_boundaries() {
        assert!(is_global_unicast_v4(Ipv4Addr::new(172, 15, 0, 1)));
        assert!(is_global_unicast_v4(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(is_global_unicast_v4(Ipv4Addr::new(100, 63, 255, 255)));
        assert!(is_global_unicast_v4(Ipv4Addr::new(100, 128, 0, 0)));
    }

    #[test]
    fn ipv6_ula_link_local_loopback_rejected() {
        assert!(!is_global_unicast_v6("fc00::1".parse().unwrap()));
        assert!(!is_global_unicast_v6("fd00::1".parse().unwrap()));
        assert!(!is_global_unicast_v6("fe80::1".parse().unwrap()));
        assert!(!is_global_unicast_v6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn ipv6_documented_global_example_accepted() {
        assert!(is_global_unicast_v6("2001:db8::1".parse().unwrap()));
    }
}
