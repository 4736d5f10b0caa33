use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Default hop budget for newly injected messages.
pub const DEFAULT_TTL: u32 = 3;

/// Neutral reputation for peers we have never observed.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Opaque, stable identifier of a mesh participant.
///
/// Usually the lowercase hex encoding of the peer's Ed25519 verifying key,
/// but any string is accepted; only the ledger ingestion path needs the
/// key form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    /// Decode the id as an Ed25519 verifying key, if it is one.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        let bytes: [u8; 32] = hex::decode(&self.0).ok()?.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key-shaped ids are long; the prefix is enough to tell peers apart in logs.
        if self.0.chars().count() > 16 {
            let prefix: String = self.0.chars().take(12).collect();
            write!(f, "{prefix}…")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Priority tier for outgoing traffic. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosClass {
    Bulk = 0,
    Sync = 1,
    RealTime = 2,
    Critical = 3,
}

impl QosClass {
    pub const ALL: [QosClass; 4] = [
        QosClass::Critical,
        QosClass::RealTime,
        QosClass::Sync,
        QosClass::Bulk,
    ];
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_ordering_follows_priority() {
        assert!(QosClass::Critical > QosClass::RealTime);
        assert!(QosClass::RealTime > QosClass::Sync);
        assert!(QosClass::Sync > QosClass::Bulk);
    }

    #[test]
    fn qos_serializes_snake_case() {
        let json = serde_json::to_string(&QosClass::RealTime).unwrap();
        assert_eq!(json, "\"real_time\"");
    }

    #[test]
    fn peer_id_key_roundtrip() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        let id = PeerId::from_verifying_key(&key);
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id.verifying_key(), Some(key));
    }

    #[test]
    fn plain_peer_id_has_no_key() {
        assert!(PeerId::from("alice").verifying_key().is_none());
        assert_eq!(PeerId::from("alice").to_string(), "alice");
    }
}
