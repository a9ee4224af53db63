//! SHA-256 content checksums for module payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Payload;

/// Hex-encoded SHA-256 digest of a payload's canonical JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl Checksum {
    /// First 12 hex digits, for tables and log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Checksum of `payload`.
///
/// The payload is encoded as compact JSON with sorted object keys at every
/// depth, so two payloads with the same content always hash identically.
pub fn payload_checksum(payload: &Payload) -> Checksum {
    let canonical = serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
    .to_string();
    let mut h = Sha256::new();
    h.update(canonical.as_bytes());
    Checksum(hex::encode(h.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let mut a = Payload::new();
        a.insert("b".into(), json!({"y": 1, "x": 2}));
        a.insert("a".into(), json!("v"));
        let mut b = Payload::new();
        b.insert("a".into(), json!("v"));
        b.insert("b".into(), json!({"x": 2, "y": 1}));
        assert_eq!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn different_content_differs() {
        let mut a = Payload::new();
        a.insert("k".into(), json!(1));
        let mut b = Payload::new();
        b.insert("k".into(), json!(2));
        assert_ne!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn empty_payload_has_stable_digest() {
        let sum = payload_checksum(&Payload::new());
        // sha256("{}")
        assert_eq!(
            sum.0,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert_eq!(sum.short().len(), 12);
    }
}
