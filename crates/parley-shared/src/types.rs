use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// Identity id = opaque string assigned by the account system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    /// Mint a fresh id (used by the account system and tests).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A verified party, as exposed to the real-time core. Credentials never
/// appear here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    pub username: String,
    /// Display name
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Status / "about" text
    #[serde(default)]
    pub about: Option<String>,
}

/// A chat message between exactly two identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: IdentityId,
    pub receiver: IdentityId,
    pub content: String,
    /// Server-assigned creation time.
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
}

impl Message {
    pub fn new(sender: IdentityId, receiver: IdentityId, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver,
            content,
            // Storage keeps microseconds.
            date: Utc::now().trunc_subsecs(6),
            seen: false,
        }
    }

    /// Whether `identity` takes part in this message.
    pub fn involves(&self, identity: &IdentityId) -> bool {
        &self.sender == identity || &self.receiver == identity
    }
}

/// Online / last-seen state of an identity.
///
/// On the wire this is `true` for online and the last-seen time in epoch
/// milliseconds otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    LastSeen(DateTime<Utc>),
}

impl Presence {
    pub fn is_online(&self) -> bool {
        matches!(self, Presence::Online)
    }
}

impl Serialize for Presence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Presence::Online => serializer.serialize_bool(true),
            Presence::LastSeen(at) => serializer.serialize_i64(at.timestamp_millis()),
        }
    }
}

impl<'de> Deserialize<'de> for Presence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Millis(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Presence::Online),
            Raw::Flag(false) => Err(serde::de::Error::custom(
                "presence must be `true` or a timestamp",
            )),
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(Presence::LastSeen)
                .ok_or_else(|| serde::de::Error::custom("last-seen timestamp out of range")),
        }
    }
}

/// Presence of every identity seen since process start.
pub type PresenceSnapshot = HashMap<IdentityId, Presence>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_wire_shape() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert(IdentityId::from("a"), Presence::Online);
        snapshot.insert(IdentityId::from("b"), Presence::LastSeen(at));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["a"], serde_json::json!(true));
        assert_eq!(json["b"], serde_json::json!(1_700_000_000_123i64));

        let back: PresenceSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_presence_rejects_false() {
        assert!(serde_json::from_str::<Presence>("false").is_err());
    }

    #[test]
    fn test_message_defaults_unseen() {
        let msg = Message::new("a".into(), "b".into(), "hi".into());
        assert!(!msg.seen);
        assert!(msg.involves(&"a".into()));
        assert!(msg.involves(&"b".into()));
        assert!(!msg.involves(&"c".into()));
    }
}
