//! Network Monitor: a long-running OS interface-change subscriber with
//! debounce, falling back to periodic polling on platforms (or runtime
//! states) where the native event stream is unavailable.

use std::collections::HashSet;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use if_watch::tokio::IfWatcher;
use if_watch::IfEvent;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::NetworkMonitorConfig;
use crate::iface::{self, InterfaceSummary};

/// A change in the set of globally routable addresses between two
/// consecutive reconciliations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkChange {
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
    pub v4_changed: bool,
    pub v6_changed: bool,
}

pub struct NetworkMonitor {
    config: NetworkMonitorConfig,
    last: RwLock<Option<InterfaceSummary>>,
    changes: broadcast::Sender<NetworkChange>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkMonitorConfig) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            config,
            last: RwLock::new(None),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.changes.subscribe()
    }

    pub fn current(&self) -> Option<InterfaceSummary> {
        self.last.read().clone()
    }

    /// Run until `cancel` fires. Any pending debounce timer is dropped on
    /// cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut watcher = match IfWatcher::new() {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "native interface watcher unavailable, relying on poll fallback");
                None
            }
        };
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut debounce: Option<Pin<Box<Sleep>>> = None;

        if let Ok(summary) = iface::enumerate().await {
            *self.last.write() = Some(summary);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("network monitor stopping");
                    return;
                }
                event = next_watcher_event(&mut watcher) => {
                    debug!(?event, "interface watcher event, starting debounce");
                    debounce = Some(Box::pin(tokio::time::sleep(self.config.debounce)));
                }
                _ = poll.tick() => {
                    debounce = Some(Box::pin(tokio::time::sleep(Duration::ZERO)));
                }
                _ = maybe_sleep(&mut debounce) => {
                    debounce = None;
                    self.reconcile().await;
                }
            }
        }
    }

    async fn reconcile(&self) {
        let summary = match iface::enumerate().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "enumerate failed during reconciliation");
                return;
            }
        };
        let prev = self.last.read().clone();
        if let Some(change) = diff(prev.as_ref(), &summary) {
            debug!(?change, "network change detected");
            let _ = self.changes.send(change);
        }
        *self.last.write() = Some(summary);
    }
}

async fn next_watcher_event(watcher: &mut Option<IfWatcher>) -> Option<std::io::Result<IfEvent>> {
    match watcher {
        Some(w) => w.next().await,
        None => futures::future::pending().await,
    }
}

async fn maybe_sleep(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.await,
        None => futures::future::pending().await,
    }
}

/// Diff two summaries' global-address sets, returning `None` iff neither
/// the v4 nor the v6 set changed.
fn diff(prev: Option<&InterfaceSummary>, next: &InterfaceSummary) -> Option<NetworkChange> {
    let empty = InterfaceSummary::default();
    let prev = prev.unwrap_or(&empty);

    let prev_v4: HashSet<IpAddr> = prev.global_v4.iter().copied().map(IpAddr::V4).collect();
    let next_v4: HashSet<IpAddr> = next.global_v4.iter().copied().map(IpAddr::V4).collect();
    let prev_v6: HashSet<IpAddr> = prev.global_v6.iter().copied().map(IpAddr::V6).collect();
    let next_v6: HashSet<IpAddr> = next.global_v6.iter().copied().map(IpAddr::V6).collect();

    let v4_changed = prev_v4 != next_v4;
    let v6_changed = prev_v6 != next_v6;
    if !v4_changed && !v6_changed {
        return None;
    }

    let added: Vec<IpAddr> = next_v4
        .difference(&prev_v4)
        .chain(next_v6.difference(&prev_v6))
        .copied()
        .collect();
    let removed: Vec<IpAddr> = prev_v4
        .difference(&next_v4)
        .chain(prev_v6.difference(&next_v6))
        .copied()
        .collect();

    Some(NetworkChange {
        added,
        removed,
        v4_changed,
        v6_changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn summary(v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>) -> InterfaceSummary {
        InterfaceSummary {
            interfaces: Vec::new(),
            global_v4: v4,
            global_v6: v6,
        }
    }

    #[test]
    fn no_change_yields_none() {
        let s = summary(vec![Ipv4Addr::new(8, 8, 8, 8)], vec![]);
        assert!(diff(Some(&s), &s).is_none());
    }

    #[test]
    fn added_address_detected() {
        let prev = summary(vec![], vec![]);
        let next = summary(vec![Ipv4Addr::new(8, 8, 8, 8)], vec![]);
        let change = diff(Some(&prev), &next).unwrap();
        assert!(change.v4_changed);
        assert!(!change.v6_changed);
        assert_eq!(change.added, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
        assert!(change.removed.is_empty());
    }

    #[test]
    fn removed_address_detected() {
        let prev = summary(vec![Ipv4Addr::new(8, 8, 8, 8)], vec![]);
        let next = summary(vec![], vec![]);
        let change = diff(Some(&prev), &next).unwrap();
        assert_eq!(change.removed, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
    }

    #[test]
    fn first_reconciliation_against_none_treats_everything_as_added() {
        let next = summary(vec![Ipv4Addr::new(1, 1, 1, 1)], vec![]);
        let change = diff(None, &next).unwrap();
        assert_eq!(change.added, vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]);
    }
}
