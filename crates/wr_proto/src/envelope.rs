//! Outer envelope for handshake datagrams.
//!
//! Everything the handshake sends is wrapped with the pair's setup keys
//! before it touches the socket:
//!
//! ```text
//! [ IV (16)
//!   ENC_setup( SHA256(payload)      (32)
//!              ∥ payload_len_be16   (2)
//!              ∥ payload
//!              ∥ padding            (0..=99 random bytes) ) ]
//! ```
//!
//! with `payload = version ∥ negType ∥ packetType ∥ body`. `ENC_setup` is
//! CFB over AES-256 keyed by the XOR of the two nodes' identity hashes;
//! the digest doubles as the integrity check (anything not keyed for us
//! fails it and falls through to the session path).

use rand::rngs::OsRng;
use rand::RngCore;

use wr_crypto::{sha256, BlockCipher, CfbStream, BLOCK_LEN};

use crate::error::WireError;
use crate::padding::{envelope_padding_len, fill_random};

pub const PROTOCOL_VERSION: u8 = 1;

/// The only negotiation type this link layer speaks. The earlier
/// station-to-station variants (0 and 1) are rejected outright.
pub const NEG_TYPE_JFK: u8 = 2;

pub const PACKET_TYPE_M1: u8 = 0;
pub const PACKET_TYPE_M2: u8 = 1;
pub const PACKET_TYPE_M3: u8 = 2;
pub const PACKET_TYPE_M4: u8 = 3;

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = 3;
const MIN_DATAGRAM: usize = BLOCK_LEN + DIGEST_LEN + 2 + HEADER_LEN;

/// A peeled handshake datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub packet_type: u8,
    pub body: Vec<u8>,
}

/// Seal a handshake message body under the outgoing setup key.
pub fn seal(setup_key: &[u8; 32], packet_type: u8, body: &[u8]) -> Vec<u8> {
    debug_assert!(packet_type <= PACKET_TYPE_M4);

    let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
    payload.push(PROTOCOL_VERSION);
    payload.push(NEG_TYPE_JFK);
    payload.push(packet_type);
    payload.extend_from_slice(body);

    let mut iv = [0u8; BLOCK_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut inner = Vec::with_capacity(DIGEST_LEN + 2 + payload.len() + 99);
    inner.extend_from_slice(&sha256(&[&payload]));
    inner.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    inner.extend_from_slice(&payload);
    let pad = envelope_padding_len(&mut OsRng);
    fill_random(&mut inner, pad, &mut OsRng);

    let cipher = BlockCipher::new(setup_key);
    CfbStream::new(&cipher, &iv).encrypt(&mut inner);

    let mut out = Vec::with_capacity(BLOCK_LEN + inner.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&inner);
    out
}

/// Peel a datagram with the incoming setup key.
///
/// A failure here is not necessarily an attack: session packets and
/// handshake traffic share the socket, so the caller treats any error as
/// "not a handshake datagram for this peer".
pub fn peel(setup_key: &[u8; 32], datagram: &[u8]) -> Result<HandshakePacket, WireError> {
    if datagram.len() < MIN_DATAGRAM {
        return Err(WireError::TooShort);
    }
    let iv: [u8; BLOCK_LEN] = datagram[..BLOCK_LEN].try_into().expect("fixed split");
    let mut inner = datagram[BLOCK_LEN..].to_vec();

    let cipher = BlockCipher::new(setup_key);
    CfbStream::new(&cipher, &iv).decrypt(&mut inner);

    let digest: [u8; DIGEST_LEN] = inner[..DIGEST_LEN].try_into().expect("fixed split");
    let len = u16::from_be_bytes([inner[DIGEST_LEN], inner[DIGEST_LEN + 1]]) as usize;
    let start = DIGEST_LEN + 2;
    if len < HEADER_LEN || start + len > inner.len() {
        return Err(WireError::BadLengthField);
    }
    let payload = &inner[start..start + len];
    if sha256(&[payload]) != digest {
        return Err(WireError::DigestMismatch);
    }

    let (version, neg_type, packet_type) = (payload[0], payload[1], payload[2]);
    if version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(version));
    }
    if neg_type != NEG_TYPE_JFK {
        return Err(WireError::BadNegotiationType(neg_type));
    }
    if packet_type > PACKET_TYPE_M4 {
        return Err(WireError::BadPacketType(packet_type));
    }

    Ok(HandshakePacket {
        packet_type,
        body: payload[HEADER_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn seal_peel_roundtrip() {
        let body = b"nonce-and-exponential".to_vec();
        let datagram = seal(&KEY, PACKET_TYPE_M1, &body);
        let packet = peel(&KEY, &datagram).unwrap();
        assert_eq!(packet.packet_type, PACKET_TYPE_M1);
        assert_eq!(packet.body, body);
    }

    #[test]
    fn sealing_is_randomised_but_peels_identically() {
        let a = seal(&KEY, PACKET_TYPE_M2, b"same body");
        let b = seal(&KEY, PACKET_TYPE_M2, b"same body");
        assert_ne!(a, b);
        assert_eq!(peel(&KEY, &a).unwrap(), peel(&KEY, &b).unwrap());
    }

    #[test]
    fn wrong_key_fails_digest() {
        let datagram = seal(&KEY, PACKET_TYPE_M1, b"body");
        let err = peel(&[0x43; 32], &datagram).unwrap_err();
        assert!(matches!(
            err,
            WireError::DigestMismatch | WireError::BadLengthField
        ));
    }

    #[test]
    fn bit_flip_in_protected_region_is_rejected() {
        let body = b"a moderately sized body for flips";
        let datagram = seal(&KEY, PACKET_TYPE_M3, body);
        // Everything up to the end of the payload is covered by the
        // digest (trailing padding is not semantic).
        let protected = BLOCK_LEN + DIGEST_LEN + 2 + HEADER_LEN + body.len();
        for i in 0..protected {
            let mut tampered = datagram.clone();
            tampered[i] ^= 0x01;
            assert!(peel(&KEY, &tampered).is_err(), "flip at byte {i} accepted");
        }
    }

    #[test]
    fn legacy_negotiation_types_rejected() {
        // Hand-build an envelope with negType 0.
        let mut payload = vec![PROTOCOL_VERSION, 0, PACKET_TYPE_M1];
        payload.extend_from_slice(b"x");
        let mut inner = Vec::new();
        inner.extend_from_slice(&sha256(&[&payload]));
        inner.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        inner.extend_from_slice(&payload);
        let iv = [5u8; BLOCK_LEN];
        let cipher = BlockCipher::new(&KEY);
        CfbStream::new(&cipher, &iv).encrypt(&mut inner);
        let mut datagram = iv.to_vec();
        datagram.extend_from_slice(&inner);

        assert_eq!(peel(&KEY, &datagram), Err(WireError::BadNegotiationType(0)));
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(peel(&KEY, &[0u8; 10]), Err(WireError::TooShort));
    }
}
