use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash of the semantically significant part of a request.
///
/// Two requests with the same idempotency key must carry the same
/// fingerprint to be treated as the same logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed hash.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// SHA-256 of raw bytes, hex encoded.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// SHA-256 of the payload's canonical JSON.
    ///
    /// Object keys are emitted in sorted order, so field order in the
    /// original payload does not change the fingerprint.
    pub fn of_json<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        let bytes = serde_json::to_vec(&value)?;
        Ok(Self::of_bytes(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_fingerprint_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"team":"Lions","members":["a","b"]}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"members":["a","b"],"team":"Lions"}"#).unwrap();
        assert_eq!(
            Fingerprint::of_json(&a).unwrap(),
            Fingerprint::of_json(&b).unwrap()
        );
    }

    #[test]
    fn different_payloads_have_different_fingerprints() {
        let a = Fingerprint::of_json(&json!({"team": "Lions"})).unwrap();
        let b = Fingerprint::of_json(&json!({"team": "Tigers"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = Fingerprint::of_bytes(b"abc");
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
