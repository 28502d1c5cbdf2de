//! Link-layer configuration.
//!
//! Every tunable the protocol depends on lives here with its default;
//! `validate` rejects combinations the state machines cannot honour.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Path MTU; no datagram ever exceeds this.
    pub mtu: usize,

    /// Overall handshake timeout; non-terminal states fall back to idle.
    pub handshake_timeout: Duration,
    /// Message 3 is retransmitted once if no reply arrived by then.
    pub m3_retransmit_after: Duration,

    /// Bounded FIFO of precomputed DH contexts.
    pub dh_pool_capacity: usize,
    /// How long one DH context may be reused for fresh handshakes.
    pub dh_context_lifetime: Duration,

    /// Minimum interval between transient-key rotations (capacity
    /// pressure can force an earlier one).
    pub transient_key_interval: Duration,
    /// Authenticator-cache capacity; reaching it rotates the transient key.
    pub authenticator_cache_capacity: usize,

    /// Rekey when fewer sequence numbers than this remain.
    pub rekey_seq_headroom: u32,
    /// Rekey after this many bytes through one tracker.
    pub rekey_byte_limit: u64,
    /// Rekey when a tracker gets this old.
    pub rekey_max_age: Duration,
    /// A rekey trigger unmet for this long is a forced disconnect.
    pub rekey_grace: Duration,

    /// Lower bound on the loss timeout (`2 × avg_rtt` otherwise).
    pub loss_timeout_floor: Duration,
    /// Blocked message-ID allocation becomes fatal after this.
    pub msg_id_block_limit: Duration,
    /// Receive-buffer cap, and the cap on our estimate of the peer's.
    pub buffer_cap: usize,
    /// Largest single message; bounded by `buffer_cap`.
    pub max_message_len: usize,

    /// Cap on the opaque peer reference carried in M3/M4.
    pub max_peer_reference_len: usize,
    /// Handshake payload timestamps further off than this are a
    /// protocol violation.
    pub max_clock_skew: Duration,

    /// Maximum coalescing delay of the packet-sender task.
    pub sender_poll_interval: Duration,
    /// Heartbeat silence after which the watchdog declares the sender
    /// task stuck.
    pub watchdog_stall_limit: Duration,

    /// `Peer::ping` gives up after this long.
    pub ping_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: 1280,
            handshake_timeout: Duration::from_secs(30),
            m3_retransmit_after: Duration::from_secs(5),
            dh_pool_capacity: 8,
            dh_context_lifetime: Duration::from_secs(300),
            transient_key_interval: Duration::from_secs(30 * 60),
            authenticator_cache_capacity: 512,
            rekey_seq_headroom: 100,
            rekey_byte_limit: 1 << 30,
            rekey_max_age: Duration::from_secs(60 * 60),
            rekey_grace: Duration::from_secs(5 * 60),
            loss_timeout_floor: Duration::from_millis(250),
            msg_id_block_limit: Duration::from_secs(10 * 60),
            buffer_cap: 256 * 1024,
            max_message_len: 256 * 1024,
            max_peer_reference_len: 4096,
            max_clock_skew: Duration::from_secs(24 * 60 * 60),
            sender_poll_interval: Duration::from_millis(200),
            watchdog_stall_limit: Duration::from_secs(3 * 60),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mtu < 256 {
            return Err(LinkError::Config("mtu must be at least 256".into()));
        }
        if self.max_message_len > self.buffer_cap {
            return Err(LinkError::Config(
                "max_message_len cannot exceed buffer_cap".into(),
            ));
        }
        if self.max_message_len as u64 > u64::from(wr_proto::MAX_MESSAGE_LEN) {
            return Err(LinkError::Config(
                "max_message_len exceeds the wire format's message bound".into(),
            ));
        }
        if self.dh_pool_capacity == 0 {
            return Err(LinkError::Config("dh_pool_capacity must be nonzero".into()));
        }
        if self.authenticator_cache_capacity == 0 {
            return Err(LinkError::Config(
                "authenticator_cache_capacity must be nonzero".into(),
            ));
        }
        if self.rekey_seq_headroom == 0 {
            return Err(LinkError::Config("rekey_seq_headroom must be nonzero".into()));
        }
        Ok(())
    }

    /// Bytes available for ack/fragment records in one packet: MTU minus
    /// the truncated MAC, the sequence number and the interior length
    /// field.
    pub fn max_records_len(&self) -> usize {
        self.mtu - wr_crypto::PACKET_MAC_LEN - wr_proto::INTERIOR_OVERHEAD
    }
}
