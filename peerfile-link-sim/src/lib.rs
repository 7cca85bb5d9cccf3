//! In-process channel simulator for peerfile unit and integration testing.
//!
//! [`LinkSimTransport`] builds connected [`peerfile_domain::Channel`] pairs
//! using tokio channels instead of real sockets. [`LinkSimConfig`] controls
//! injected impairments:
//!
//! - Backpressure high-water mark (unread bytes per direction)
//! - Bandwidth cap (token bucket on delivery)
//! - Scripted disconnect after N messages
//!
//! Delivery is always ordered, reliable and boundary-preserving, which is
//! the contract the transfer core relies on.
//!
//! # Quick start
//!
//! ```rust
//! use peerfile_link_sim::{LinkSimConfig, LinkSimTransport};
//!
//! let pair = LinkSimTransport::new(LinkSimConfig::congested()).connected_pair();
//! pair.control.disconnect();
//! ```

mod channel;
mod config;
mod link;
mod transport;

// --- public API
pub use config::LinkSimConfig;
pub use link::{LinkSimControl, LinkSimPair};
pub use transport::LinkSimTransport;

pub(crate) use channel::{LinkSimRx, LinkSimTx};
