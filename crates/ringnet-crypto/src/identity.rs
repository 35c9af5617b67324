//! Long-term peer identity: RSA keypair, ring signature, ring authority key.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::Oaep;

pub use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{CryptoError, CryptoResult};

/// Modulus size for generated long-term keypairs.
pub const RSA_BITS: usize = 2048;

/// File locations for identity material.
///
/// A missing private-key file triggers generation of a fresh keypair (written
/// back when a path is given). The ring public key and signature files are
/// required.
#[derive(Debug, Clone, Default)]
pub struct IdentityPaths {
    pub private_key: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub ring_public_key: PathBuf,
    pub signature: PathBuf,
}

/// A peer's long-term identity. Read-only after startup.
#[derive(Clone)]
pub struct Identity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_pem: String,
    ring_signature: Vec<u8>,
    ring_public: RsaPublicKey,
}

impl Identity {
    /// Assemble an identity from in-memory parts, verifying the ring
    /// signature over the public key.
    pub fn from_parts(
        private: RsaPrivateKey,
        ring_public: RsaPublicKey,
        ring_signature: Vec<u8>,
    ) -> CryptoResult<Self> {
        let public = RsaPublicKey::from(&private);
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if !verify_with(&ring_public, public_pem.as_bytes(), &ring_signature) {
            return Err(CryptoError::RingSignatureRejected);
        }
        Ok(Self {
            private,
            public,
            public_pem,
            ring_signature,
            ring_public,
        })
    }

    /// Load an identity from key files.
    ///
    /// The private key is generated fresh (2048 bits) when its file is
    /// missing; the ring public key and signature files are fatal when
    /// missing or unverifiable.
    pub fn load(paths: &IdentityPaths) -> CryptoResult<Self> {
        let ring_pem = std::fs::read_to_string(&paths.ring_public_key)?;
        let ring_public = RsaPublicKey::from_public_key_pem(&ring_pem)
            .map_err(|e| CryptoError::InvalidKey(format!("ring public key: {}", e)))?;

        let sig_text = std::fs::read_to_string(&paths.signature)?;
        let ring_signature = decode_signature(&sig_text)?;

        let private = match &paths.private_key {
            Some(path) if path.exists() => {
                let pem = std::fs::read_to_string(path)?;
                RsaPrivateKey::from_pkcs8_pem(&pem)
                    .map_err(|e| CryptoError::InvalidKey(format!("private key: {}", e)))?
            }
            other => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                    .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
                if let Some(path) = other {
                    write_private_pem(&key, path)?;
                }
                key
            }
        };

        let identity = Self::from_parts(private, ring_public, ring_signature)?;

        if let Some(path) = &paths.public_key {
            if !path.exists() {
                std::fs::write(path, identity.public_pem.as_bytes())?;
            }
        }

        Ok(identity)
    }

    /// PEM (SPKI) encoding of the public key; this is what the ring
    /// authority signed and what travels in HELO.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// The ring authority's signature over this peer's public key.
    pub fn ring_signature(&self) -> &[u8] {
        &self.ring_signature
    }

    /// Base64 form of the ring signature, as sent on the wire.
    pub fn ring_signature_b64(&self) -> String {
        BASE64.encode(&self.ring_signature)
    }

    /// The ring authority's public key.
    pub fn ring_public(&self) -> &RsaPublicKey {
        &self.ring_public
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// True when `sig` is this peer's own ring signature (self-connect check).
    pub fn is_own_signature(&self, sig: &[u8]) -> bool {
        self.ring_signature == sig
    }

    /// Verify a candidate peer's admission: the ring authority must have
    /// signed the presented public key PEM.
    pub fn verify_ring(&self, public_pem: &str, signature: &[u8]) -> bool {
        verify_with(&self.ring_public, public_pem.as_bytes(), signature)
    }

    /// Sign arbitrary bytes with the long-term private key (SHA-256,
    /// PKCS#1 v1.5).
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signer = SigningKey::<Sha256>::new(self.private.clone());
        signer.sign(data).to_vec()
    }

    /// Encrypt session material for a peer under its public key (OAEP).
    pub fn wrap_for(&self, peer: &RsaPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        peer.encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|e| CryptoError::Wrap(e.to_string()))
    }

    /// Decrypt session material addressed to this peer.
    pub fn unwrap(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), data)
            .map_err(|e| CryptoError::Unwrap(e.to_string()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("private", &"[REDACTED]")
            .field("ring_signature", &BASE64.encode(&self.ring_signature))
            .finish()
    }
}

/// Verify `signature` over `data` with `public` (SHA-256, PKCS#1 v1.5).
pub fn verify_with(public: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = Signature::try_from(signature) else {
        return false;
    };
    let verifier = VerifyingKey::<Sha256>::new(public.clone());
    verifier.verify(data, &sig).is_ok()
}

/// Parse an SPKI PEM public key.
pub fn public_key_from_pem(pem: &str) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::InvalidKey(format!("public key: {}", e)))
}

/// Authority-side primitive: sign a peer's public key PEM, producing its
/// ring signature. Used by admission tooling and tests.
pub fn sign_public_key(authority: &RsaPrivateKey, public_pem: &str) -> Vec<u8> {
    let signer = SigningKey::<Sha256>::new(authority.clone());
    signer.sign(public_pem.as_bytes()).to_vec()
}

fn write_private_pem(key: &RsaPrivateKey, path: &Path) -> CryptoResult<()> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    std::fs::write(path, pem.as_bytes())?;
    Ok(())
}

/// Signature files hold base64 text; raw binary files are accepted as well.
fn decode_signature(text: &str) -> CryptoResult<Vec<u8>> {
    let trimmed = text.trim();
    match BASE64.decode(trimmed) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(trimmed.as_bytes().to_vec()),
    }
}
