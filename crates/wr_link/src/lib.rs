//! Warren secure link - the per-peer secure packet pipeline of a
//! friend-to-friend overlay node.
//!
//! Three subsystems, glued by [`LinkNode`]:
//!
//! * the JFK-style four-message [`handshake`] with responder-side DoS
//!   resistance (stateless authenticators, bounded DH-context pool,
//!   replay cache),
//! * the [`session`] packetizer: sequence-number-indexed encrypt-and-
//!   authenticate framing over the [`tracker`] trio with watchlist
//!   matching and rekey policy,
//! * the reliable [`channel`]: fragmented messages over a sliding
//!   message-ID window with per-priority queues, piggybacked acks,
//!   RTT-driven loss detection and 256 KiB backpressure both ways.
//!
//! The node owns no socket and no peer database; it talks to both
//! through the [`collaborators`] traits.

pub mod channel;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handshake;
pub mod node;
pub mod peer;
pub mod ranges;
pub mod session;
pub mod tracker;

mod sender;
mod watchdog;

pub use channel::{Priority, SendOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{PeerDirectory, PeerId, PeerInfo, PeerRole, Transport};
pub use config::LinkConfig;
pub use error::{FailureReason, LinkError};
pub use node::{LinkNode, PeerStats};
pub use peer::Peer;
