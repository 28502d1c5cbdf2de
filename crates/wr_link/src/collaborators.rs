//! Interfaces to the node's external collaborators.
//!
//! The link layer neither owns a socket nor decides who its peers are:
//! datagrams go out through `Transport`, peer knowledge and lifecycle
//! notifications go through `PeerDirectory`. Both are object-safe so the
//! node can hold them as trait objects.

use std::fmt;
use std::net::SocketAddr;

use crate::error::FailureReason;

/// Opaque per-node peer handle id; never a reference, so trackers and
/// tasks cannot keep a peer alive by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// The small closed set of peer roles. Roles differ only in handshake
/// admission and disconnect policy; everything else is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Manually-trusted friend; always allowed to initiate.
    Darknet,
    /// Stranger admitted through the open network.
    Opennet,
    /// Announcement bootstrap peer; short-lived by design.
    Seed,
}

impl PeerRole {
    /// May this peer open a handshake towards us?
    pub fn accepts_unsolicited_handshake(&self) -> bool {
        !matches!(self, PeerRole::Seed)
    }

    /// Transient peers are dropped once their purpose completes rather
    /// than retained across restarts.
    pub fn is_transient(&self) -> bool {
        matches!(self, PeerRole::Seed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Long-term Ed25519 verifying key.
    pub public_key: [u8; 32],
    pub address: SocketAddr,
    pub role: PeerRole,
}

/// Datagram egress. Receive is wired the other way round: the owner of
/// the socket feeds `LinkNode::handle_datagram`.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, datagram: &[u8], dest: SocketAddr);
}

/// Peer knowledge and lifecycle sink.
pub trait PeerDirectory: Send + Sync + 'static {
    fn lookup_by_address(&self, addr: &SocketAddr) -> Option<PeerInfo>;

    /// A handshake completed; `reference` is the peer's opaque
    /// compressed reference from the signed payload, handed over
    /// unchanged.
    fn on_connected(&self, info: &PeerInfo, reference: &[u8]);

    fn on_disconnected(&self, info: &PeerInfo, reason: &FailureReason);
}
