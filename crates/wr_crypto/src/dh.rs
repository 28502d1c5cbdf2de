//! X25519 Diffie–Hellman contexts.
//!
//! A context is a fresh exponent, its exponential, and a pre-computed
//! identity signature over the exponential. Contexts are generated off
//! the hot path and pooled so a responder never performs a signature per
//! incoming handshake; the pool itself lives in the link crate.
//!
//! Validity checks on wire input:
//!   - an exponential must be exactly 32 bytes;
//!   - the u-coordinates 0 and 1 are rejected outright;
//!   - an all-zero shared secret (small-subgroup / non-contributory
//!     exchange) is rejected after the DH.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::sign::{SigningIdentity, SIGNATURE_LEN};

pub const EXPONENTIAL_LEN: usize = 32;

/// Domain-separation prefix for the signature over an exponential.
pub const EXPONENTIAL_SIGN_CONTEXT: &[u8] = b"warren-exp";

#[derive(ZeroizeOnDrop)]
pub struct DhContext {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; EXPONENTIAL_LEN],
    #[zeroize(skip)]
    signature: [u8; SIGNATURE_LEN],
}

impl DhContext {
    /// Generate a fresh exponent and sign its exponential with the node
    /// identity. This is the expensive operation the pool amortises.
    pub fn generate(identity: &SigningIdentity) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        let signature = identity.sign(&[EXPONENTIAL_SIGN_CONTEXT, &public]);
        Self {
            secret: secret.to_bytes(),
            public,
            signature,
        }
    }

    pub fn public(&self) -> &[u8; EXPONENTIAL_LEN] {
        &self.public
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Compute the shared secret with a validated peer exponential.
    pub fn shared_secret(
        &self,
        peer_public: &[u8; EXPONENTIAL_LEN],
    ) -> Result<[u8; 32], CryptoError> {
        let secret = StaticSecret::from(self.secret);
        let shared = secret.diffie_hellman(&X25519Public::from(*peer_public));
        let bytes = *shared.as_bytes();
        if bytes == [0u8; 32] {
            return Err(CryptoError::BadPoint);
        }
        Ok(bytes)
    }
}

/// Validate an exponential received off the wire.
pub fn validate_exponential(bytes: &[u8]) -> Result<[u8; EXPONENTIAL_LEN], CryptoError> {
    let public: [u8; EXPONENTIAL_LEN] =
        bytes.try_into().map_err(|_| CryptoError::BadLength {
            expected: EXPONENTIAL_LEN,
            got: bytes.len(),
        })?;
    let mut one = [0u8; EXPONENTIAL_LEN];
    one[0] = 1;
    if public == [0u8; EXPONENTIAL_LEN] || public == one {
        return Err(CryptoError::BadPoint);
    }
    Ok(public)
}

/// Verify a peer's signature over its exponential.
pub fn verify_exponential_signature(
    peer_identity: &[u8; 32],
    exponential: &[u8; EXPONENTIAL_LEN],
    signature: &[u8],
) -> Result<(), CryptoError> {
    crate::sign::verify(
        peer_identity,
        &[EXPONENTIAL_SIGN_CONTEXT, exponential],
        signature,
    )
}
