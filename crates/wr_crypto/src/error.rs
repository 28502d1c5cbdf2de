use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("bad length: expected {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("invalid group element")]
    BadPoint,

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}
