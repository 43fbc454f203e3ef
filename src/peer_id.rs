//! Peer identity.
//!
//! Identifiers are opaque, content-addressed handles derived from a
//! long-lived public key; equality is bytewise. The core never mints or
//! verifies identifiers itself — that belongs to the external identity store
//! and the transport's handshake — it only carries them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A peer identifier. Newtype over `libp2p::PeerId` so the core has one
/// place to pin the canonical text encoding (used by the gossip wire format
/// and the LAN discovery TXT records) independent of whatever `libp2p`
/// chooses to expose.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentifier(libp2p::PeerId);

impl PeerIdentifier {
    pub fn from_peer_id(id: libp2p::PeerId) -> Self {
        Self(id)
    }

    pub fn as_peer_id(&self) -> libp2p::PeerId {
        self.0
    }

    /// Canonical text form, as carried in multiaddresses and the gossip
    /// wire format's `from` field.
    pub fn to_canonical(&self) -> String {
        self.0.to_string()
    }

    pub fn parse_canonical(s: &str) -> Result<Self, InvalidPeerIdentifier> {
        s.parse()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn random() -> Self {
        Self(libp2p::PeerId::random())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid peer identifier: {0}")]
pub struct InvalidPeerIdentifier(String);

impl FromStr for PeerIdentifier {
    type Err = InvalidPeerIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<libp2p::PeerId>()
            .map(Self)
            .map_err(|e| InvalidPeerIdentifier(e.to_string()))
    }
}

impl fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentifier({})", self.0)
    }
}

impl From<libp2p::PeerId> for PeerIdentifier {
    fn from(id: libp2p::PeerId) -> Self {
        Self(id)
    }
}

impl Serialize for PeerIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for PeerIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable snapshot of the set of peers this node is authorized to
/// maintain connections with. The core consumes this as a value handed in
/// via `SetWatchlist`; the external auth subsystem owns mutation and
/// hot-reload.
pub type AuthorizedSet = std::collections::HashSet<PeerIdentifier>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_canonical_text() {
        let id = PeerIdentifier::random();
        let text = id.to_canonical();
        let parsed = PeerIdentifier::parse_canonical(&text).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = PeerIdentifier::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: PeerIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn rejects_garbage() {
        assert!(PeerIdentifier::parse_canonical("not-a-peer-id").is_err());
    }

    #[test]
    fn equality_is_bytewise() {
        let a = PeerIdentifier::random();
        let b = PeerIdentifier::from_str(&a.to_canonical()).unwrap();
        assert_eq!(a, b);
    }
}
