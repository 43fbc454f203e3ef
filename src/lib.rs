//! Overlay connectivity core.
//!
//! This crate owns the subsystems responsible for establishing and keeping
//! the best possible path to every authorized peer in a small, explicitly
//! authorized overlay: parallel dialing, exponential-backoff reconnection,
//! LAN discovery, NAT/reachability classification, and presence gossip.
//!
//! Everything outside this connectivity plane — CLI, YAML config loading,
//! the per-service TCP proxy, on-disk key storage, Prometheus exposition —
//! is an external collaborator reached through the traits in [`external`].

pub mod config;
pub mod error;
pub mod external;
pub mod gossip;
pub mod iface;
pub mod lan_discovery;
pub mod metrics;
pub mod multiaddr;
pub mod net_monitor;
pub mod path_dialer;
pub mod path_tracker;
pub mod peer_id;
pub mod peer_manager;
pub mod reachability;
pub mod stun;

mod facade;

pub use config::Config;
pub use error::OverlayError;
pub use facade::{Network, NetworkChange};
pub use peer_id::PeerIdentifier;
