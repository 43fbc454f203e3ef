//! STUN Prober: RFC 5389 Binding Requests fired in parallel at every
//! configured server, fused into a NAT-family inference.
//!
//! The wire codec (binding request/response encode-decode) is hand-rolled:
//! nothing in this workspace's dependency stack implements RFC 5389, and a
//! STUN probe is a handful of fixed-layout reads and writes, not worth a new
//! dependency for.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::config::StunConfig;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

#[derive(Debug, Error)]
pub enum StunError {
    #[error("every configured STUN server failed to respond")]
    AllServersFailed,
    #[error("no STUN servers configured")]
    NoServersConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatFamily {
    None,
    FullCone,
    AddressRestricted,
    PortRestricted,
    Symmetric,
    Unknown,
}

impl NatFamily {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            NatFamily::None => "none",
            NatFamily::FullCone => "full-cone",
            NatFamily::AddressRestricted => "address-restricted",
            NatFamily::PortRestricted => "port-restricted",
            NatFamily::Symmetric => "symmetric",
            NatFamily::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerProbeOutcome {
    pub server: String,
    pub observed: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct StunResult {
    pub outcomes: Vec<ServerProbeOutcome>,
    pub nat_family: NatFamily,
    /// Deduplicated external socket addresses observed across all servers.
    pub external_addrs: Vec<SocketAddr>,
    pub cgnat: bool,
    pub probed_at: SystemTime,
}

impl StunResult {
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.observed.is_some()).count()
    }
}

/// Run one binding-request round against every configured server, racing
/// each against `min(deadline, per_probe_timeout)`.
///
/// `cgnat` is supplied by the caller (the Reachability Classifier derives it
/// from the Interface Inventory, not from STUN) and is carried through
/// unchanged on the result.
pub async fn probe(config: &StunConfig, deadline: Duration, cgnat: bool) -> Result<StunResult, StunError> {
    if config.servers.is_empty() {
        return Err(StunError::NoServersConfigured);
    }
    let per_probe = deadline.min(config.per_probe_timeout);

    let futures = config.servers.iter().map(|server| {
        let server = server.clone();
        async move {
            let observed = probe_one(&server, per_probe).await;
            ServerProbeOutcome { server, observed }
        }
    });
    let outcomes: Vec<ServerProbeOutcome> = futures::future::join_all(futures).await;

    if outcomes.iter().all(|o| o.observed.is_none()) {
        return Err(StunError::AllServersFailed);
    }

    let mut external_addrs: Vec<SocketAddr> = outcomes.iter().filter_map(|o| o.observed).collect();
    external_addrs.sort_by_key(|a| (a.ip(), a.port()));
    external_addrs.dedup();

    let nat_family = infer_nat_family(&outcomes);

    Ok(StunResult {
        outcomes,
        nat_family,
        external_addrs,
        cgnat,
        probed_at: SystemTime::now(),
    })
}

async fn probe_one(server: &str, per_probe: Duration) -> Option<SocketAddr> {
    match timeout(per_probe, probe_one_inner(server)).await {
        Ok(Ok(addr)) => Some(addr),
        Ok(Err(e)) => {
            debug!(%server, error = %e, "stun probe failed");
            None
        }
        Err(_elapsed) => {
            debug!(%server, "stun probe timed out");
            None
        }
    }
}

async fn probe_one_inner(server: &str) -> std::io::Result<SocketAddr> {
    let server_addr = tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no ipv4 address"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;

    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    let request = encode_binding_request(&transaction_id);
    socket.send(&request).await?;

    let mut buf = [0u8; 512];
    let n = socket.recv(&mut buf).await?;
    decode_binding_response(&buf[..n], &transaction_id)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed or mismatched stun response"))
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes()); // length: no attributes
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn decode_binding_response(buf: &[u8], expected_transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if buf.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE_SUCCESS {
        return None;
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let magic_cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if magic_cookie != MAGIC_COOKIE {
        return None;
    }
    if &buf[8..20] != expected_transaction_id {
        return None;
    }
    if buf.len() < 20 + msg_len {
        return None;
    }

    let mut mapped: Option<SocketAddr> = None;
    let mut xor_mapped: Option<SocketAddr> = None;
    let mut offset = 20;
    let end = 20 + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &buf[value_start..value_end];
        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = decode_mapped_address(value),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_xor_mapped_address(value, expected_transaction_id),
            _ => {}
        }
        // Attributes are padded to a 4-byte boundary.
        offset = value_end + ((4 - (attr_len % 4)) % 4);
    }

    xor_mapped.or(mapped)
}

fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);

    let xaddr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    let addr = xaddr ^ MAGIC_COOKIE;
    let ip = Ipv4Addr::from(addr);

    let _ = transaction_id; // IPv6 XOR would additionally fold in the transaction id; unused for v4.
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// NAT family inference from the set of successful probes (spec-free
/// restatement of RFC 3489 mapping-behavior discovery, conservative: we
/// never claim full-cone without a CHANGE-REQUEST-capable probe).
fn infer_nat_family(outcomes: &[ServerProbeOutcome]) -> NatFamily {
    let observed: Vec<SocketAddr> = outcomes.iter().filter_map(|o| o.observed).collect();
    match observed.len() {
        0 => NatFamily::Unknown,
        1 => NatFamily::Unknown,
        _ => {
            let ips: HashSet<IpAddr> = observed.iter().map(|a| a.ip()).collect();
            if ips.len() > 1 {
                return NatFamily::Symmetric;
            }
            let ports: HashSet<u16> = observed.iter().map(|a| a.port()).collect();
            if ports.len() == 1 {
                NatFamily::AddressRestricted
            } else {
                NatFamily::PortRestricted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_outcome(server: &str, ip: [u8; 4], port: u16) -> ServerProbeOutcome {
        ServerProbeOutcome {
            server: server.to_string(),
            observed: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
        }
    }

    #[test]
    fn zero_successes_is_unknown() {
        let outcomes = vec![ServerProbeOutcome {
            server: "s1".into(),
            observed: None,
        }];
        assert_eq!(infer_nat_family(&outcomes), NatFamily::Unknown);
    }

    #[test]
    fn one_success_is_unknown() {
        let outcomes = vec![fake_outcome("s1", [203, 0, 113, 50], 12345)];
        assert_eq!(infer_nat_family(&outcomes), NatFamily::Unknown);
    }

    #[test]
    fn same_ip_same_port_is_address_restricted() {
        let outcomes = vec![
            fake_outcome("s1", [203, 0, 113, 50], 12345),
            fake_outcome("s2", [203, 0, 113, 50], 12345),
        ];
        assert_eq!(infer_nat_family(&outcomes), NatFamily::AddressRestricted);
    }

    #[test]
    fn same_ip_differing_ports_is_port_restricted() {
        let outcomes = vec![
            fake_outcome("s1", [203, 0, 113, 50], 12345),
            fake_outcome("s2", [203, 0, 113, 50], 12400),
        ];
        assert_eq!(infer_nat_family(&outcomes), NatFamily::PortRestricted);
    }

    #[test]
    fn differing_ips_is_symmetric() {
        let outcomes = vec![
            fake_outcome("s1", [203, 0, 113, 50], 12345),
            fake_outcome("s2", [198, 51, 100, 10], 12400),
        ];
        assert_eq!(infer_nat_family(&outcomes), NatFamily::Symmetric);
    }

    #[test]
    fn binding_request_roundtrips_through_response_codec() {
        let transaction_id = [7u8; 12];
        let request = encode_binding_request(&transaction_id);
        assert_eq!(request.len(), 20);
        assert_eq!(u16::from_be_bytes([request[0], request[1]]), BINDING_REQUEST);

        // Build a synthetic success response carrying an XOR-MAPPED-ADDRESS
        // for 203.0.113.50:12345 and confirm it decodes back correctly.
        let ip = Ipv4Addr::new(203, 0, 113, 50);
        let port: u16 = 12345;
        let xport = port ^ ((MAGIC_COOKIE >> 16) as u16);
        let xaddr = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;

        let mut attr_value = vec![0u8, FAMILY_IPV4];
        attr_value.extend_from_slice(&xport.to_be_bytes());
        attr_value.extend_from_slice(&xaddr.to_be_bytes());

        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE_SUCCESS.to_be_bytes());
        response.extend_from_slice(&((4 + attr_value.len()) as u16).to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&transaction_id);
        response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&(attr_value.len() as u16).to_be_bytes());
        response.extend_from_slice(&attr_value);

        let decoded = decode_binding_response(&response, &transaction_id).unwrap();
        assert_eq!(decoded, SocketAddr::new(IpAddr::V4(ip), port));
    }

    #[test]
    fn response_with_mismatched_transaction_id_is_rejected() {
        let transaction_id = [7u8; 12];
        let other_id = [9u8; 12];
        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE_SUCCESS.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&other_id);
        assert!(decode_binding_response(&response, &transaction_id).is_none());
    }
}
