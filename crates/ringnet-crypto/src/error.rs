//! Crypto error types

use thiserror::Error;

/// Errors from cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// IO error while reading or writing key files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key material failed to parse
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The ring authority's signature over a public key did not verify
    #[error("ring signature rejected")]
    RingSignatureRejected,

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Asymmetric wrap of session material failed
    #[error("session material wrap failed: {0}")]
    Wrap(String),

    /// Asymmetric unwrap of session material failed
    #[error("session material unwrap failed: {0}")]
    Unwrap(String),

    /// Symmetric decryption failed (bad ciphertext or padding)
    #[error("decryption failed")]
    Decrypt,

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
