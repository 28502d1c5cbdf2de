//! Warren secure link - cryptographic primitives.
//!
//! Deterministic building blocks only, no I/O and no clocks: AES-256
//! block + CFB-128 stream mode, SHA-256, HMAC-SHA256, Ed25519
//! signatures, X25519 key agreement, and the handshake/tracker key
//! derivations. Everything above this crate (packet formats, state
//! machines, scheduling) lives in `wr_proto` and `wr_link`.

pub mod block;
pub mod dh;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod mac;
pub mod sign;

pub use block::{BlockCipher, CfbStream, BLOCK_LEN, KEY_LEN};
pub use dh::{validate_exponential, DhContext, EXPONENTIAL_LEN};
pub use error::CryptoError;
pub use hash::{sha256, xor32, HASH_LEN};
pub use kdf::{jfk_keys, tracker_keys, JfkKeys, TrackerKeySchedule, IV_NONCE_LEN, NONCE_LEN};
pub use mac::{hmac_sha256, hmac_verify, hmac_verify_truncated, MAC_LEN, PACKET_MAC_LEN};
pub use sign::{identity_hash_of, verify, SigningIdentity, PUBLIC_KEY_LEN, SIGNATURE_LEN};
