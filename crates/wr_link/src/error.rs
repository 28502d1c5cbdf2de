use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown peer")]
    UnknownPeer,

    #[error("empty payloads are reserved for link-internal messages")]
    EmptyPayload,

    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLong { len: usize, max: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a peer was torn down. Surfaced to the peer-management
/// collaborator as a single event; transient decode and replay errors
/// never reach this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Handshake signature did not verify against the peer's long-term key.
    SignatureMismatch,
    /// Peer reference in the handshake payload exceeded the cap.
    OversizedReference,
    /// Handshake payload timestamp more than a day away from ours.
    ClockSkew,
    /// A rekey trigger fired and no new tracker arrived within the grace
    /// period.
    RekeyOverrun,
    /// Outbound message-ID allocation stayed blocked past the limit.
    MessageWindowStalled,
    /// The peer's boot ID keeps changing; restart loop.
    BootIdFlapLoop,
    /// Local disconnect requested by the caller.
    Requested(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureMismatch => write!(f, "handshake signature mismatch"),
            Self::OversizedReference => write!(f, "oversized peer reference"),
            Self::ClockSkew => write!(f, "clock skew beyond limit"),
            Self::RekeyOverrun => write!(f, "rekey not completed within grace period"),
            Self::MessageWindowStalled => write!(f, "message-id window stalled"),
            Self::BootIdFlapLoop => write!(f, "peer boot id flapping"),
            Self::Requested(reason) => write!(f, "requested: {reason}"),
        }
    }
}
