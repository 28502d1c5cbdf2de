//! Warren secure link - wire formats.
//!
//! Pure (de)serialisation: the handshake outer envelope, the session
//! packet interior and its ack/fragment records, varints, padding
//! policy, and serial-number arithmetic. No state machines here; the
//! link crate owns those.

pub mod envelope;
pub mod error;
pub mod packet;
pub mod padding;
pub mod serial;
pub mod varint;

pub use envelope::{
    peel, seal, HandshakePacket, NEG_TYPE_JFK, PACKET_TYPE_M1, PACKET_TYPE_M2, PACKET_TYPE_M3,
    PACKET_TYPE_M4, PROTOCOL_VERSION,
};
pub use error::WireError;
pub use packet::{
    ack_block_len, frame_interior, unframe_interior, Fragment, PacketPayload,
    FRAGMENT_HEADER_MAX, INTERIOR_OVERHEAD, MAX_MESSAGE_LEN,
};
pub use serial::{MSG_ID_BITS, MSG_ID_MOD, SEQ_BITS, SEQ_MOD};
