//! RingNet Crypto
//!
//! Cryptographic primitives for the RingNet overlay:
//! - `Identity`: a peer's long-term RSA-2048 keypair plus its ring-signed
//!   admission ticket and the ring authority's public key
//! - `SessionCipher`: per-direction AES-256-CBC session material
//! - `sha256_hex`: message hashing

#![forbid(unsafe_code)]

mod cipher;
mod error;
mod hash;
mod identity;

pub use cipher::{SessionCipher, IV_LEN, KEY_LEN};
pub use error::{CryptoError, CryptoResult};
pub use hash::sha256_hex;
pub use identity::{
    public_key_from_pem, sign_public_key, verify_with, Identity, IdentityPaths, RsaPrivateKey,
    RsaPublicKey, RSA_BITS,
};
