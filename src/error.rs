//! Crate-wide error aggregation.
//!
//! Every component defines its own `thiserror` enum close to where the
//! errors are produced (see `stun::StunError`, `path_dialer::DialError`,
//! `peer_manager::PeerManagerError`, ...). `OverlayError` exists only for the
//! façade's public surface, where callers want one error type to match on.

use thiserror::Error;

use crate::gossip::GossipError;
use crate::lan_discovery::LanDiscoveryError;
use crate::path_dialer::DialError;
use crate::peer_manager::PeerManagerError;
use crate::stun::StunError;

/// Top-level error returned by [`crate::Network`].
///
/// Construction-time failures (invalid config, an unparseable static relay
/// address) are programmer errors: they are returned from `Network::new` and
/// must never propagate from a running component.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    PeerManager(#[from] PeerManagerError),

    #[error(transparent)]
    Gossip(#[from] GossipError),

    #[error(transparent)]
    LanDiscovery(#[from] LanDiscoveryError),

    #[error(transparent)]
    Stun(#[from] StunError),

    #[error("operation cancelled")]
    Cancelled,
}
