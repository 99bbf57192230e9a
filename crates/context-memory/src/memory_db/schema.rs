//! Database schema definitions for the long-term memory store.

use crate::error::MemoryError;
use crate::memory::{Message, Metadata, OwnerKey, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The persisted unit in the vector memory store: a denormalized superset of
/// `Message` with index-internal fields (partition key, insertion sequence).
/// Once inserted, the stored copy evolves independently of any session copy,
/// importance updates excepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub role: Role,
    pub character_id: Option<String>,
    pub user_id: Option<String>,
    /// Canonical composite partition string, the isolation boundary.
    pub partition: String,
    /// Monotonic insertion sequence within the store (SQLite rowid).
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub importance_score: f32,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl MemoryRecord {
    /// Builds a record from a message that already carries an embedding.
    /// The sequence number is assigned on insert.
    pub fn from_message(message: &Message) -> Result<Self, MemoryError> {
        message.owner.validate()?;
        let embedding = message.embedding.clone().ok_or_else(|| {
            MemoryError::InvalidInput(format!("message {} has no embedding", message.id))
        })?;
        Ok(Self {
            id: message.id.clone(),
            text: message.text.clone(),
            role: message.role,
            character_id: message.owner.character_id.clone(),
            user_id: message.owner.user_id.clone(),
            partition: message.owner.partition(),
            seq: 0,
            timestamp: message.timestamp,
            importance_score: message.importance_score,
            embedding,
            metadata: message.metadata.clone(),
        })
    }

    pub fn owner(&self) -> OwnerKey {
        OwnerKey::new(self.character_id.clone(), self.user_id.clone())
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            text: self.text,
            role: self.role,
            timestamp: self.timestamp,
            importance_score: self.importance_score,
            owner: OwnerKey::new(self.character_id, self.user_id),
            embedding: Some(self.embedding),
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Semantic,
    Keyword,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: Message,
    pub similarity: f32,
    pub source: SearchSource,
}

/// Hybrid search output. `used_fallback` is true when the semantic candidate
/// set was empty (or embeddings were unavailable) and the hits are
/// keyword-only matches ranked by recency; callers must not present those
/// as semantic matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSearchResult {
    pub hits: Vec<SearchHit>,
    pub used_fallback: bool,
}

pub const SCHEMA_SQL: &str = "
-- Long-term memory entries
CREATE TABLE IF NOT EXISTS memories (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    text TEXT NOT NULL,
    role TEXT NOT NULL,
    character_id TEXT,
    user_id TEXT,
    partition TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    importance_score REAL NOT NULL DEFAULT 0.0,
    embedding BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
-- Saved context sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    character_id TEXT,
    user_id TEXT,
    messages TEXT NOT NULL
);
-- Indexes for partition-scoped scans
CREATE INDEX IF NOT EXISTS idx_memories_partition ON memories (partition);
CREATE INDEX IF NOT EXISTS idx_memories_character ON memories (character_id);
CREATE INDEX IF NOT EXISTS idx_memories_user ON memories (user_id);
CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories (timestamp);
";
