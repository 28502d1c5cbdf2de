//! Key derivation.
//!
//! `jfk_keys` — the handshake's fixed formula: each of the three session
//! keys is `HMAC-SHA256(g^ir, nonce_i ∥ nonce_r ∥ label)` with labels
//! "0" (session master), "1" (payload encryption), "2" (payload MAC).
//!
//! `tracker_keys` — HKDF-SHA256 expansion of the session master into the
//! per-tracker material: one cipher key per direction, the IV-derivation
//! key, the MAC key, and the 12-byte IV nonce.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::mac::hmac_sha256;

pub const NONCE_LEN: usize = 8;
pub const IV_NONCE_LEN: usize = 12;

/// The three keys produced by the JFK exchange.
#[derive(ZeroizeOnDrop)]
pub struct JfkKeys {
    /// Session master; everything a KeyTracker needs derives from it.
    pub k_s: [u8; 32],
    /// Encrypts the signed payload of messages 3 and 4.
    pub k_e: [u8; 32],
    /// Authenticates the ciphertext of messages 3 and 4.
    pub k_a: [u8; 32],
}

pub fn jfk_keys(shared: &[u8; 32], nonce_i: &[u8; NONCE_LEN], nonce_r: &[u8; NONCE_LEN]) -> JfkKeys {
    let derive = |label: &[u8]| hmac_sha256(shared, &[nonce_i, nonce_r, label]);
    JfkKeys {
        k_s: derive(b"0"),
        k_e: derive(b"1"),
        k_a: derive(b"2"),
    }
}

/// Per-tracker key material expanded from the session master.
///
/// Directional: the initiator of the handshake sends on `init_to_resp`
/// and receives on `resp_to_init`; the responder mirrors.
#[derive(ZeroizeOnDrop)]
pub struct TrackerKeySchedule {
    pub init_to_resp: [u8; 32],
    pub resp_to_init: [u8; 32],
    pub iv_key: [u8; 32],
    pub mac_key: [u8; 32],
    #[zeroize(skip)]
    pub iv_nonce: [u8; IV_NONCE_LEN],
}

pub fn tracker_keys(k_s: &[u8; 32]) -> Result<TrackerKeySchedule, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"warren-tracker-v1"), k_s);
    let expand = |info: &[u8], out: &mut [u8]| {
        hk.expand(info, out)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    };

    let mut schedule = TrackerKeySchedule {
        init_to_resp: [0u8; 32],
        resp_to_init: [0u8; 32],
        iv_key: [0u8; 32],
        mac_key: [0u8; 32],
        iv_nonce: [0u8; IV_NONCE_LEN],
    };
    expand(b"warren-init-to-resp", &mut schedule.init_to_resp)?;
    expand(b"warren-resp-to-init", &mut schedule.resp_to_init)?;
    expand(b"warren-iv", &mut schedule.iv_key)?;
    expand(b"warren-mac", &mut schedule.mac_key)?;
    expand(b"warren-iv-nonce", &mut schedule.iv_nonce)?;
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jfk_keys_are_distinct_and_deterministic() {
        let shared = [11u8; 32];
        let ni = [1u8; 8];
        let nr = [2u8; 8];
        let a = jfk_keys(&shared, &ni, &nr);
        let b = jfk_keys(&shared, &ni, &nr);
        assert_eq!(a.k_s, b.k_s);
        assert_eq!(a.k_e, b.k_e);
        assert_eq!(a.k_a, b.k_a);
        assert_ne!(a.k_s, a.k_e);
        assert_ne!(a.k_e, a.k_a);
    }

    #[test]
    fn jfk_keys_bind_nonces() {
        let shared = [11u8; 32];
        let a = jfk_keys(&shared, &[1u8; 8], &[2u8; 8]);
        let b = jfk_keys(&shared, &[2u8; 8], &[1u8; 8]);
        assert_ne!(a.k_s, b.k_s);
    }

    #[test]
    fn tracker_schedule_is_directional() {
        let ks = tracker_keys(&[5u8; 32]).unwrap();
        assert_ne!(ks.init_to_resp, ks.resp_to_init);
        assert_ne!(ks.iv_key, ks.mac_key);
        let again = tracker_keys(&[5u8; 32]).unwrap();
        assert_eq!(ks.init_to_resp, again.init_to_resp);
        assert_eq!(ks.iv_nonce, again.iv_nonce);
    }
}
