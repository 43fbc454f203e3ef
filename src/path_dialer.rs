//! Path Dialer: races a DHT leg against a relay leg for a single peer,
//! falling back to a fast path when the transport already reports a live
//! connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DialerConfig;
use crate::external::{DialOpts, Host, MetricsSink, RoutingError, RoutingOracle};
use crate::multiaddr;
use crate::path_tracker::PathType;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial cancelled")]
    Cancelled,
    #[error("both dial legs failed: dht={dht}, relay={relay}")]
    BothLegsFailed { dht: String, relay: String },
}

#[derive(Debug, Clone)]
pub struct DialOutcome {
    pub path_type: PathType,
    pub duration: Duration,
    pub selected_address: Option<Multiaddr>,
}

pub struct PathDialer<H: Host> {
    host: Arc<H>,
    routing: Option<Arc<dyn RoutingOracle>>,
    metrics: Arc<dyn MetricsSink>,
    relay_addresses: Vec<Multiaddr>,
    config: DialerConfig,
}

impl<H: Host> PathDialer<H> {
    pub fn new(
        host: Arc<H>,
        routing: Option<Arc<dyn RoutingOracle>>,
        metrics: Arc<dyn MetricsSink>,
        relay_addresses: Vec<Multiaddr>,
        config: DialerConfig,
    ) -> Self {
        Self {
            host,
            routing,
            metrics,
            relay_addresses,
            config,
        }
    }

    pub async fn dial(&self, peer: PeerId, cancel: CancellationToken) -> Result<DialOutcome, DialError> {
        self.dial_inner(peer, cancel, DialOpts::default()).await
    }

    /// Variant used by the LAN-discovery and probe-worker upgrade paths:
    /// skips the fast path (which would otherwise short-circuit on the
    /// existing relay connection) and annotates both legs "force direct"
    /// so the transport establishes a new direct path alongside it.
    pub async fn dial_force_direct(&self, peer: PeerId, cancel: CancellationToken) -> Result<DialOutcome, DialError> {
        self.dial_inner(peer, cancel, DialOpts::force_direct()).await
    }

    async fn dial_inner(&self, peer: PeerId, cancel: CancellationToken, opts: DialOpts) -> Result<DialOutcome, DialError> {
        let start = Instant::now();

        if !opts.force_direct {
            if let Some(outcome) = self.fast_path(peer).await {
                self.record_metric(outcome.path_type, true);
                return Ok(outcome);
            }
        }

        let leg_cancel = cancel.child_token();
        let dht_cancel = leg_cancel.clone();
        let relay_cancel = leg_cancel.clone();

        let result = race_first_ok(
            self.dht_leg(peer, dht_cancel, opts),
            self.relay_leg(peer, relay_cancel, opts),
        )
        .await;
        leg_cancel.cancel();

        if cancel.is_cancelled() {
            return Err(DialError::Cancelled);
        }

        match result {
            Ok(_selected) => {
                let path_type = self.classify_live(peer).await;
                let outcome = DialOutcome {
                    path_type,
                    duration: start.elapsed(),
                    selected_address: None,
                };
                self.record_metric(outcome.path_type, true);
                Ok(outcome)
            }
            Err((dht_err, relay_err)) => {
                self.metrics.incr_counter(
                    "path_dialer_dial_total",
                    &[("result", "failure"), ("path", "unknown")],
                );
                Err(DialError::BothLegsFailed {
                    dht: dht_err,
                    relay: relay_err,
                })
            }
        }
    }

    async fn fast_path(&self, peer: PeerId) -> Option<DialOutcome> {
        let conns = self.host.conns_to_peer(peer).await;
        if conns.is_empty() {
            return None;
        }
        let path_type = if conns.iter().any(|c| !c.limited) {
            PathType::Direct
        } else {
            PathType::Relayed
        };
        Some(DialOutcome {
            path_type,
            duration: Duration::ZERO,
            selected_address: conns.first().map(|c| c.remote_multiaddr.clone()),
        })
    }

    async fn classify_live(&self, peer: PeerId) -> PathType {
        let conns = self.host.conns_to_peer(peer).await;
        if conns.iter().any(|c| !c.limited) {
            PathType::Direct
        } else {
            PathType::Relayed
        }
    }

    async fn dht_leg(&self, peer: PeerId, cancel: CancellationToken, opts: DialOpts) -> Result<Multiaddr, String> {
        let routing = self.routing.clone().ok_or_else(|| "no routing oracle configured".to_string())?;

        let find = tokio::time::timeout(self.config.dht_find_peer_timeout, routing.find_peer(peer, self.config.dht_find_peer_timeout));
        let addr = tokio::select! {
            _ = cancel.cancelled() => return Err("cancelled".into()),
            res = find => match res {
                Ok(Ok(addr)) => addr,
                Ok(Err(RoutingError::NotFound)) => return Err("peer not found via routing oracle".into()),
                Ok(Err(RoutingError::Timeout)) => return Err("routing oracle find_peer timed out".into()),
                Err(_elapsed) => return Err("routing oracle find_peer timed out".into()),
            },
        };

        let connect = tokio::time::timeout(self.config.dht_connect_timeout, self.host.connect(&addr, opts));
        tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".into()),
            res = connect => match res {
                Ok(Ok(())) => Ok(addr),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_elapsed) => Err("dht leg connect timed out".into()),
            },
        }
    }

    async fn relay_leg(&self, peer: PeerId, cancel: CancellationToken, opts: DialOpts) -> Result<Multiaddr, String> {
        if self.relay_addresses.is_empty() {
            return Err("no static relay addresses configured".into());
        }

        let mut last_err = String::new();
        for relay in &self.relay_addresses {
            if cancel.is_cancelled() {
                return Err("cancelled".into());
            }
            let circuit = multiaddr::circuit_address(relay, peer);
            self.host
                .add_addrs(peer, vec![circuit.clone()], Duration::from_secs(10 * 60))
                .await;

            let connect = tokio::time::timeout(self.config.relay_connect_timeout, self.host.connect(&circuit, opts));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err("cancelled".into()),
                res = connect => res,
            };
            match outcome {
                Ok(Ok(())) => return Ok(circuit),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_elapsed) => last_err = "relay leg connect timed out".to_string(),
            }
        }
        Err(last_err)
    }

    fn record_metric(&self, path_type: PathType, success: bool) {
        let path = match path_type {
            PathType::Direct => "direct",
            PathType::Relayed => "relayed",
        };
        let result = if success { "success" } else { "failure" };
        self.metrics
            .incr_counter("path_dialer_dial_total", &[("result", result), ("path", path)]);
    }
}

/// Race two fallible legs to the first success; if both fail, return both
/// errors. Neither leg is dropped early on the other's failure.
async fn race_first_ok<A, B, T>(a: A, b: B) -> Result<T, (String, String)>
where
    A: std::future::Future<Output = Result<T, String>>,
    B: std::future::Future<Output = Result<T, String>>,
{
    tokio::pin!(a, b);
    let mut a_result: Option<Result<T, String>> = None;
    let mut b_result: Option<Result<T, String>> = None;

    loop {
        tokio::select! {
            res = &mut a, if a_result.is_none() => { a_result = Some(res); }
            res = &mut b, if b_result.is_none() => { b_result = Some(res); }
        }

        if let Some(Ok(_)) = &a_result {
            debug!("dht leg won the race");
            return Ok(a_result.unwrap().unwrap());
        }
        if let Some(Ok(_)) = &b_result {
            debug!("relay leg won the race");
            return Ok(b_result.unwrap().unwrap());
        }
        if a_result.is_some() && b_result.is_some() {
            let ae = a_result.unwrap().unwrap_err();
            let be = b_result.unwrap().unwrap_err();
            warn!(dht_error = %ae, relay_error = %be, "both dial legs failed");
            return Err((ae, be));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_returns_first_success() {
        let a = async { tokio::time::sleep(Duration::from_millis(50)).await; Ok::<_, String>(1) };
        let b = async { Err::<i32, String>("fast failure".into()) };
        let result = race_first_ok(a, b).await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn race_returns_both_errors_when_both_fail() {
        let a = async { Err::<i32, String>("a failed".into()) };
        let b = async { Err::<i32, String>("b failed".into()) };
        let result = race_first_ok(a, b).await;
        assert_eq!(result, Err(("a failed".into(), "b failed".into())));
    }
}
