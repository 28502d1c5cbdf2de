//! SHA-256 helpers.

use sha2::{Digest, Sha256};

pub const HASH_LEN: usize = 32;

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// XOR of two 32-byte values; used to combine identity hashes into the
/// handshake setup keys.
pub fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_concatenation_is_flat() {
        assert_eq!(sha256(&[b"ab", b"c"]), sha256(&[b"abc"]));
    }

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(&[b"abc"])),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn xor_is_involutive() {
        let a = [0x5au8; 32];
        let b = [0xc3u8; 32];
        assert_eq!(xor32(&xor32(&a, &b), &b), a);
    }
}
