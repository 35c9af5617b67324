//! Message hashing

use sha2::{Digest, Sha256};

/// SHA-256 over the concatenation of the given parts, hex-encoded.
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = sha256_hex(&[b"hello", b"world"]);
        let b = sha256_hex(&[b"hello", b"world"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_depends_on_content() {
        let a = sha256_hex(&[b"hello"]);
        let b = sha256_hex(&[b"hellp"]);
        assert_ne!(a, b);
    }

    #[test]
    fn known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(&[b"abc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
