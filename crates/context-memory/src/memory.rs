//! Core data model: messages, owner keys, sessions, and memory statistics.

use crate::error::MemoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Dialog role. Precedence for importance scoring is system > user > assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(MemoryError::InvalidInput(format!(
                "unknown role '{other}', expected system|user|assistant"
            ))),
        }
    }
}

/// Isolation partition for memory entries, keyed by character and/or user
/// identity. At least one component must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl OwnerKey {
    pub fn new(character_id: Option<String>, user_id: Option<String>) -> Self {
        Self { character_id, user_id }
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self { character_id: None, user_id: Some(user_id.into()) }
    }

    pub fn for_character(character_id: impl Into<String>) -> Self {
        Self { character_id: Some(character_id.into()), user_id: None }
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.character_id.is_none() && self.user_id.is_none() {
            return Err(MemoryError::InvalidInput(
                "owner key requires at least one of character_id or user_id".into(),
            ));
        }
        Ok(())
    }

    /// Canonical partition string used as the store's isolation boundary.
    pub fn partition(&self) -> String {
        format!(
            "c:{}|u:{}",
            self.character_id.as_deref().unwrap_or(""),
            self.user_id.as_deref().unwrap_or("")
        )
    }

    /// Whether an entry owned by `other` is visible through this key when it
    /// is used as a search filter. A missing component matches anything, so a
    /// character-only filter spans that character's users; a fully specified
    /// filter matches exactly one partition.
    pub fn matches(&self, other: &OwnerKey) -> bool {
        let char_ok = match &self.character_id {
            Some(c) => other.character_id.as_deref() == Some(c.as_str()),
            None => true,
        };
        let user_ok = match &self.user_id {
            Some(u) => other.user_id.as_deref() == Some(u.as_str()),
            None => true,
        };
        char_ok && user_ok
    }
}

/// Open metadata value: recognized scalar shapes plus a JSON escape hatch for
/// opaque pass-through values. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

pub type Metadata = HashMap<String, MetadataValue>;

/// A unit of dialog. `id`, `text` and `role` are immutable after creation;
/// the importance score is recomputable and the embedding is derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub importance_score: f32,
    pub owner: OwnerKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(text: impl Into<String>, role: Role, owner: OwnerKey) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            role,
            timestamp: Utc::now(),
            importance_score: 0.0,
            owner,
            embedding: None,
            metadata: Metadata::new(),
        }
    }

    /// Rough size estimate used for character-based compression budgets.
    pub fn size_chars(&self) -> usize {
        self.text.chars().count()
    }
}

/// Working-set container for an active conversation. Insertion order of
/// `messages` is the only source of recency and is semantically meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: OwnerKey,
    pub messages: Vec<Message>,
}

impl ContextSession {
    pub fn new(id: impl Into<String>, owner: OwnerKey) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            owner,
            messages: Vec::new(),
        }
    }

    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.size_chars()).sum()
    }
}

/// Read-only aggregate over an owner partition, recomputed on demand and
/// never cached beyond a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_memories: usize,
    pub average_importance: f32,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn test_owner_key_requires_one_component() {
        assert!(OwnerKey::default().validate().is_err());
        assert!(OwnerKey::for_user("u1").validate().is_ok());
        assert!(OwnerKey::for_character("c1").validate().is_ok());
    }

    #[test]
    fn test_owner_key_partition_is_composite() {
        let full = OwnerKey::new(Some("char1".into()), Some("user1".into()));
        assert_eq!(full.partition(), "c:char1|u:user1");
        assert_ne!(full.partition(), OwnerKey::for_user("user1").partition());
    }

    #[test]
    fn test_partial_owner_filter_matches() {
        let stored = OwnerKey::new(Some("char1".into()), Some("user1".into()));
        assert!(OwnerKey::for_character("char1").matches(&stored));
        assert!(OwnerKey::for_user("user1").matches(&stored));
        assert!(stored.matches(&stored));
        assert!(!OwnerKey::for_user("user2").matches(&stored));
    }

    #[test]
    fn test_metadata_untagged_serde() {
        let mut meta = Metadata::new();
        meta.insert("topic".into(), MetadataValue::Text("weather".into()));
        meta.insert("turns".into(), MetadataValue::Number(3.0));
        meta.insert("pinned".into(), MetadataValue::Flag(true));

        let json = serde_json::to_string(&meta).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("topic"), Some(&MetadataValue::Text("weather".into())));
        assert_eq!(back.get("pinned"), Some(&MetadataValue::Flag(true)));
    }
}
