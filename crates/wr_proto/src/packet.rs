//! Session packet payload records.
//!
//! A session packet's plaintext interior is
//! `seq_be32 ∥ payload_len_be16 ∥ payload ∥ padding`; the sequence
//! number is handled by the key tracker, the length field makes the
//! record stream self-delimiting under padding (mirroring the outer
//! envelope), and this module owns the `payload` itself:
//!
//! ```text
//! payload = ack_count (varint) ∥ ack_count × seq_be32 ∥ fragment*
//! fragment = header_word_be32            28-bit message id, bit 28 = is_first
//!            ∥ message_length (varint)   only when is_first
//!            ∥ offset (varint)           only when !is_first
//!            ∥ length (varint)
//!            ∥ data
//! ```
//!
//! Message IDs live in `[0, 2^28)`; a message never exceeds the 256 KiB
//! receive-buffer cap, so the varints above stay within three bytes and
//! a fragment header within nine.

use bytes::{BufMut, BytesMut};

use crate::error::WireError;
use crate::serial::{MSG_ID_MOD, SEQ_MOD};
use crate::varint::{read_varint, varint_len, write_varint};

/// Upper bound on a single reassembled message (the buffer cap).
pub const MAX_MESSAGE_LEN: u32 = 1 << 18;

/// Worst-case encoded fragment header.
pub const FRAGMENT_HEADER_MAX: usize = 9;

/// Interior overhead ahead of the payload: 4-byte seq + 2-byte length.
pub const INTERIOR_OVERHEAD: usize = 6;

const FIRST_FLAG: u32 = 1 << 28;
const HEADER_RESERVED: u32 = !(MSG_ID_MOD - 1) & !FIRST_FLAG;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u32,
    pub is_first: bool,
    /// Byte offset of `data` within the message; zero when `is_first`.
    pub offset: u32,
    /// Total message length; present only when `is_first`.
    pub message_length: Option<u32>,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn first(message_id: u32, message_length: u32, data: Vec<u8>) -> Self {
        Self {
            message_id,
            is_first: true,
            offset: 0,
            message_length: Some(message_length),
            data,
        }
    }

    pub fn continuation(message_id: u32, offset: u32, data: Vec<u8>) -> Self {
        Self {
            message_id,
            is_first: false,
            offset,
            message_length: None,
            data,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let varints = if self.is_first {
            varint_len(self.message_length.unwrap_or(0))
        } else {
            varint_len(self.offset)
        };
        4 + varints + varint_len(self.data.len() as u32) + self.data.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketPayload {
    pub acks: Vec<u32>,
    pub fragments: Vec<Fragment>,
}

/// Encoded size of an ack block carrying `n` sequence numbers.
pub fn ack_block_len(n: usize) -> usize {
    varint_len(n as u32) + 4 * n
}

impl PacketPayload {
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.fragments.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        ack_block_len(self.acks.len())
            + self
                .fragments
                .iter()
                .map(Fragment::encoded_len)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        write_varint(&mut buf, self.acks.len() as u32);
        for &seq in &self.acks {
            debug_assert!(seq < SEQ_MOD);
            buf.put_u32(seq);
        }
        for frag in &self.fragments {
            debug_assert!(frag.message_id < MSG_ID_MOD);
            let mut word = frag.message_id;
            if frag.is_first {
                word |= FIRST_FLAG;
            }
            buf.put_u32(word);
            if frag.is_first {
                write_varint(&mut buf, frag.message_length.expect("first carries length"));
            } else {
                write_varint(&mut buf, frag.offset);
            }
            write_varint(&mut buf, frag.data.len() as u32);
            buf.put_slice(&frag.data);
        }
        buf.to_vec()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let mut input = bytes;

        let ack_count = read_varint(&mut input)? as usize;
        if ack_count * 4 > input.len() {
            return Err(WireError::Malformed("ack block overruns payload"));
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            let (head, rest) = input.split_at(4);
            input = rest;
            let seq = u32::from_be_bytes(head.try_into().expect("fixed split"));
            if seq >= SEQ_MOD {
                return Err(WireError::Malformed("ack outside sequence space"));
            }
            acks.push(seq);
        }

        let mut fragments = Vec::new();
        while !input.is_empty() {
            if input.len() < 4 {
                return Err(WireError::TooShort);
            }
            let (head, rest) = input.split_at(4);
            input = rest;
            let word = u32::from_be_bytes(head.try_into().expect("fixed split"));
            if word & HEADER_RESERVED != 0 {
                return Err(WireError::Malformed("reserved fragment bits set"));
            }
            let is_first = word & FIRST_FLAG != 0;
            let message_id = word & (MSG_ID_MOD - 1);

            let (offset, message_length) = if is_first {
                let total = read_varint(&mut input)?;
                if total > MAX_MESSAGE_LEN {
                    return Err(WireError::Malformed("message length over cap"));
                }
                (0, Some(total))
            } else {
                let offset = read_varint(&mut input)?;
                if offset >= MAX_MESSAGE_LEN {
                    return Err(WireError::Malformed("offset over cap"));
                }
                (offset, None)
            };

            let len = read_varint(&mut input)? as usize;
            if len > input.len() {
                return Err(WireError::Malformed("fragment data overruns payload"));
            }
            if len == 0 && message_length != Some(0) {
                return Err(WireError::Malformed("empty fragment"));
            }
            let (data, rest) = input.split_at(len);
            input = rest;

            fragments.push(Fragment {
                message_id,
                is_first,
                offset,
                message_length,
                data: data.to_vec(),
            });
        }

        Ok(Self { acks, fragments })
    }
}

/// Frame the encoded payload into the plaintext interior handed to the
/// key tracker (after the sequence number): `len_be16 ∥ payload ∥ pad`.
/// `padded_len` is the target length of the whole interior.
pub fn frame_interior(payload: &[u8], padded_len: usize, rng: &mut impl rand::RngCore) -> Vec<u8> {
    debug_assert!(payload.len() + 2 <= padded_len);
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    let remaining = padded_len - out.len();
    crate::padding::fill_random(&mut out, remaining, rng);
    out
}

/// Strip the interior framing, returning the payload slice.
pub fn unframe_interior(interior: &[u8]) -> Result<&[u8], WireError> {
    if interior.len() < 2 {
        return Err(WireError::TooShort);
    }
    let len = u16::from_be_bytes([interior[0], interior[1]]) as usize;
    if 2 + len > interior.len() {
        return Err(WireError::BadLengthField);
    }
    Ok(&interior[2..2 + len])
}
