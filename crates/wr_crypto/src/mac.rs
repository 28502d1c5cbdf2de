//! HMAC-SHA256 with constant-time verification.
//!
//! Session packets carry only the leading four bytes of the packet MAC —
//! sized to fit the receiver's watchlist matcher, not for replay
//! resistance (that comes from sequence-number uniqueness per tracker) —
//! so a truncated verify is provided alongside the full one.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub const MAC_LEN: usize = 32;
pub const PACKET_MAC_LEN: usize = 4;

fn mac_instance(key: &[u8], parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    for p in parts {
        mac.update(p);
    }
    mac
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    mac_instance(key, parts).finalize().into_bytes().into()
}

/// Constant-time verification of a full 32-byte tag.
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
    mac_instance(key, parts)
        .verify_slice(tag)
        .map_err(|_| CryptoError::MacMismatch)
}

/// Constant-time verification of a left-truncated tag (e.g. the 4-byte
/// packet MAC).
pub fn hmac_verify_truncated(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
    mac_instance(key, parts)
        .verify_truncated_left(tag)
        .map_err(|_| CryptoError::MacMismatch)
}
