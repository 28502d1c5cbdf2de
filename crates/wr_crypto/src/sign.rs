//! Long-term node identity: an Ed25519 signing key.
//!
//! The 32-byte identity hash (SHA-256 of the verifying key) is the
//! node's stable name on the wire; the hash-of-hash feeds the handshake
//! setup-key derivation.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::hash::sha256;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Node signing identity. Drop clears the secret via `ZeroizeOnDrop`.
#[derive(ZeroizeOnDrop)]
pub struct SigningIdentity {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; PUBLIC_KEY_LEN],
}

impl SigningIdentity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public: signing.verifying_key().to_bytes(),
            secret: signing.to_bytes(),
        }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = secret.try_into().map_err(|_| CryptoError::BadLength {
            expected: 32,
            got: secret.len(),
        })?;
        let signing = SigningKey::from_bytes(&secret);
        Ok(Self {
            public: signing.verifying_key().to_bytes(),
            secret,
        })
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// SHA-256 of the verifying key.
    pub fn identity_hash(&self) -> [u8; 32] {
        identity_hash_of(&self.public)
    }

    /// Sign the concatenation of `parts`; 64-byte raw signature.
    pub fn sign(&self, parts: &[&[u8]]) -> [u8; SIGNATURE_LEN] {
        let msg = concat(parts);
        SigningKey::from_bytes(&self.secret).sign(&msg).to_bytes()
    }
}

/// SHA-256 of a peer's verifying key.
pub fn identity_hash_of(public: &[u8; PUBLIC_KEY_LEN]) -> [u8; 32] {
    sha256(&[public])
}

/// Verify a 64-byte signature over the concatenation of `parts`.
pub fn verify(
    public: &[u8; PUBLIC_KEY_LEN],
    parts: &[&[u8]],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let sig: [u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| CryptoError::BadLength {
        expected: SIGNATURE_LEN,
        got: signature.len(),
    })?;
    let vk = VerifyingKey::from_bytes(public)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let msg = concat(parts);
    vk.verify_strict(&msg, &Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::SignatureVerification)
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(len);
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let id = SigningIdentity::generate();
        let sig = id.sign(&[b"exponential ", b"bytes"]);
        assert!(verify(&id.public_bytes(), &[b"exponential bytes"], &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let id = SigningIdentity::generate();
        let sig = id.sign(&[b"message"]);
        assert_eq!(
            verify(&id.public_bytes(), &[b"other"], &sig),
            Err(CryptoError::SignatureVerification)
        );
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let a = SigningIdentity::generate();
        let b = SigningIdentity::generate();
        let sig = a.sign(&[b"message"]);
        assert_eq!(
            verify(&b.public_bytes(), &[b"message"], &sig),
            Err(CryptoError::SignatureVerification)
        );
    }

    #[test]
    fn identity_survives_serialisation() {
        let id = SigningIdentity::generate();
        let restored = SigningIdentity::from_bytes(id.secret_bytes()).unwrap();
        assert_eq!(id.public_bytes(), restored.public_bytes());
        assert_eq!(id.identity_hash(), identity_hash_of(&id.public_bytes()));
    }

    #[test]
    fn truncated_signature_is_bad_length() {
        let id = SigningIdentity::generate();
        let sig = id.sign(&[b"m"]);
        assert_eq!(
            verify(&id.public_bytes(), &[b"m"], &sig[..40]),
            Err(CryptoError::BadLength {
                expected: 64,
                got: 40
            })
        );
    }
}
