//! Symmetric session cipher: AES-256-CBC with PKCS#7 padding.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session key length in bytes.
pub const KEY_LEN: usize = 32;
/// Initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// One direction's session material. The key and IV are fixed for the
/// lifetime of the connection; each frame is a fresh CBC run over them.
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionCipher {
    /// Generate fresh material from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Build a cipher from received material, checking lengths.
    pub fn from_parts(key: &[u8], iv: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "session key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "session IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let mut k = [0u8; KEY_LEN];
        let mut v = [0u8; IV_LEN];
        k.copy_from_slice(key);
        v.copy_from_slice(iv);
        Ok(Self { key: k, iv: v })
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Encrypt a plaintext and return base64 ciphertext.
    pub fn encrypt_b64(&self, plaintext: &[u8]) -> String {
        let ct = Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        BASE64.encode(ct)
    }

    /// Decrypt base64 ciphertext back to plaintext bytes.
    pub fn decrypt_b64(&self, body: &str) -> CryptoResult<Vec<u8>> {
        let ct = BASE64.decode(body.trim())?;
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ct)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}
