use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short")]
    TooShort,

    #[error("unknown protocol version {0}")]
    BadVersion(u8),

    #[error("unknown negotiation type {0}")]
    BadNegotiationType(u8),

    #[error("unknown handshake packet type {0}")]
    BadPacketType(u8),

    #[error("payload digest mismatch")]
    DigestMismatch,

    #[error("length field exceeds datagram bounds")]
    BadLengthField,

    #[error("varint overflows u32")]
    VarintOverflow,

    #[error("malformed record: {0}")]
    Malformed(&'static str),
}
