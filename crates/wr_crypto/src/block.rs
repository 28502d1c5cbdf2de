//! AES-256 block primitive and the CFB-128 stream mode used for all
//! link-layer encryption.
//!
//! The block cipher is only ever run in the encrypt direction: CFB
//! generates its keystream by encrypting the previous ciphertext block,
//! for decryption as well as encryption. Per-packet IVs are themselves
//! produced by encrypting `iv_nonce ∥ seq` with a dedicated IV key, so a
//! receiver can precompute the leading ciphertext bytes of any expected
//! sequence number (the watchlist tags).

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::error::CryptoError;

pub const BLOCK_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// AES-256 with its key bound. Cheap to clone, never exposes the key.
#[derive(Clone, Debug)]
pub struct BlockCipher {
    inner: Aes256,
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            inner: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::BadLength {
            expected: KEY_LEN,
            got: key.len(),
        })?;
        Ok(Self::new(key))
    }

    pub fn encrypt_block(&self, block: [u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut b = GenericArray::clone_from_slice(&block);
        self.inner.encrypt_block(&mut b);
        let mut out = [0u8; BLOCK_LEN];
        out.copy_from_slice(&b);
        out
    }
}

/// Incremental CFB-128 over [`BlockCipher`].
///
/// Keystream block i is `E(C_{i-1})` with `C_{-1} = IV`; partial trailing
/// blocks cost nothing extra.
pub struct CfbStream {
    cipher: BlockCipher,
    keystream: [u8; BLOCK_LEN],
    register: [u8; BLOCK_LEN],
    pos: usize,
}

impl CfbStream {
    pub fn new(cipher: &BlockCipher, iv: &[u8; BLOCK_LEN]) -> Self {
        Self {
            cipher: cipher.clone(),
            keystream: cipher.encrypt_block(*iv),
            register: [0u8; BLOCK_LEN],
            pos: 0,
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let c = *byte ^ self.keystream[self.pos];
            self.register[self.pos] = c;
            *byte = c;
            self.advance();
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let c = *byte;
            *byte = c ^ self.keystream[self.pos];
            self.register[self.pos] = c;
            self.advance();
        }
    }

    fn advance(&mut self) {
        self.pos += 1;
        if self.pos == BLOCK_LEN {
            self.keystream = self.cipher.encrypt_block(self.register);
            self.pos = 0;
        }
    }
}
