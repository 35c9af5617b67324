//! Wire messages: JSON envelopes with a typed header and a body that is
//! either a plain object (HELO, TRUSTED) or base64 ciphertext (data frames).

use chrono::{SecondsFormat, Utc};
use ringnet_crypto::sha256_hex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Reserved frame type names, in code order.
pub const RESERVED_NAMES: [&str; 5] = ["HELO", "TRUSTED", "CONFIRM", "PEERS", "MESSAGE"];

/// Frame type: reserved types travel as their numeric codes, embedder
/// types as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameType {
    Helo,
    Trusted,
    Confirm,
    Peers,
    Message,
    Custom(String),
}

impl FrameType {
    /// Numeric wire code for reserved types.
    pub fn code(&self) -> Option<u8> {
        match self {
            FrameType::Helo => Some(0),
            FrameType::Trusted => Some(1),
            FrameType::Confirm => Some(2),
            FrameType::Peers => Some(3),
            FrameType::Message => Some(4),
            FrameType::Custom(_) => None,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(FrameType::Helo),
            1 => Some(FrameType::Trusted),
            2 => Some(FrameType::Confirm),
            3 => Some(FrameType::Peers),
            4 => Some(FrameType::Message),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FrameType::Helo => "HELO",
            FrameType::Trusted => "TRUSTED",
            FrameType::Confirm => "CONFIRM",
            FrameType::Peers => "PEERS",
            FrameType::Message => "MESSAGE",
            FrameType::Custom(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, FrameType::Custom(_))
    }

    /// Token mixed into the message hash: the code for reserved types,
    /// the name for embedder types.
    fn hash_token(&self) -> String {
        match self.code() {
            Some(code) => code.to_string(),
            None => self.name().to_string(),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for FrameType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.code() {
            Some(code) => serializer.serialize_u8(code),
            None => serializer.serialize_str(self.name()),
        }
    }
}

impl<'de> Deserialize<'de> for FrameType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TypeVisitor;

        impl Visitor<'_> for TypeVisitor {
            type Value = FrameType;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a reserved type code or a type name string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FrameType, E> {
                FrameType::from_code(v)
                    .ok_or_else(|| E::custom(format!("unknown type code {}", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FrameType, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(FrameType::from_code)
                    .ok_or_else(|| E::custom(format!("unknown type code {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FrameType, E> {
                Ok(FrameType::Custom(v.to_string()))
            }
        }

        deserializer.deserialize_any(TypeVisitor)
    }
}

/// The (hash, timestamp) pair a CONFIRM acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmTag {
    pub hash: String,
    pub timestamp: String,
}

/// Frame header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub hash: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<ConfirmTag>,
}

/// One wire frame: header plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub body: Value,
}

impl Envelope {
    /// Build an envelope with a fresh timestamp and deterministic hash over
    /// (type, body, timestamp).
    pub fn new(kind: FrameType, body: Value) -> Self {
        let timestamp = now_timestamp();
        let hash = hash_for(&kind, &canonical(&body), &timestamp);
        Self {
            header: Header {
                kind,
                hash,
                timestamp,
                signature: None,
                confirm: None,
            },
            body,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Canonical serialization of a body value. `serde_json` keeps object keys
/// sorted, so both ends produce identical bytes for the same value.
pub fn canonical(body: &Value) -> String {
    serde_json::to_string(body).unwrap_or_default()
}

/// Deterministic message hash over (type, body, timestamp).
pub fn hash_for(kind: &FrameType, body_text: &str, timestamp: &str) -> String {
    sha256_hex(&[
        kind.hash_token().as_bytes(),
        body_text.as_bytes(),
        timestamp.as_bytes(),
    ])
}

/// Wall-clock timestamp: ISO-8601 UTC with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// HELO body: the sender's admission ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeloBody {
    /// PEM-encoded long-term public key
    pub public_key: String,
    /// Base64 ring signature over that key
    pub signature: String,
}

/// Advertised listening endpoint inside TRUSTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listening {
    pub port: u16,
    pub address: String,
}

/// TRUSTED body: wrapped session material plus gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedBody {
    /// Base64, RSA-wrapped 32-byte session key
    pub key: String,
    /// Base64, RSA-wrapped 16-byte IV
    pub iv: String,
    /// Sender's current peer list, omitting the addressee
    pub peers: Vec<PeerRecord>,
    pub listening: Listening,
    pub require_confirmation: bool,
}

/// One gossiped peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    /// Base64 ring signature
    pub signature: String,
    pub created: String,
    pub active: String,
    pub trusted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_codes_roundtrip() {
        for code in 0..5u64 {
            let kind = FrameType::from_code(code).unwrap();
            assert_eq!(kind.code(), Some(code as u8));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, code.to_string());
            let back: FrameType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
        assert!(FrameType::from_code(9).is_none());
    }

    #[test]
    fn custom_type_is_a_string() {
        let kind = FrameType::Custom("CustomX".into());
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"CustomX\"");
        let back: FrameType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
        assert!(!back.is_reserved());
    }

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(FrameType::Message, json!({"a": 1, "b": "two"}));
        let text = env.to_text();
        let back = Envelope::from_text(&text).unwrap();
        assert_eq!(back.header.kind, FrameType::Message);
        assert_eq!(back.header.hash, env.header.hash);
        assert_eq!(back.body, env.body);
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let ts = "2024-01-01T00:00:00.000Z";
        let a = hash_for(&FrameType::Message, "\"x\"", ts);
        let b = hash_for(&FrameType::Message, "\"x\"", ts);
        let c = hash_for(&FrameType::Message, "\"y\"", ts);
        let d = hash_for(&FrameType::Confirm, "\"x\"", ts);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn canonical_sorts_object_keys() {
        let v1: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let v2: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical(&v1), canonical(&v2));
    }

    #[test]
    fn optional_header_fields_are_omitted() {
        let env = Envelope::new(FrameType::Helo, json!({}));
        let text = env.to_text();
        assert!(!text.contains("signature"));
        assert!(!text.contains("confirm"));
    }

    #[test]
    fn trusted_body_uses_camel_case() {
        let body = TrustedBody {
            key: "k".into(),
            iv: "i".into(),
            peers: vec![],
            listening: Listening {
                port: 26781,
                address: "example.org".into(),
            },
            require_confirmation: true,
        };
        let text = serde_json::to_string(&body).unwrap();
        assert!(text.contains("requireConfirmation"));
        assert!(!text.contains("require_confirmation"));
    }

    #[test]
    fn timestamp_has_subsecond_precision() {
        let ts = now_timestamp();
        assert!(ts.contains('.'));
        assert!(ts.ends_with('Z'));
    }
}
