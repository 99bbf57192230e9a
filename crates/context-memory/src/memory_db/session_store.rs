//! Session persistence: whole-session snapshots serialized as JSON.

use crate::error::MemoryError;
use crate::memory::ContextSession;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::sync::Arc;

pub struct SessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SessionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, MemoryError> {
        self.pool.get().map_err(MemoryError::from)
    }

    /// Upserts the session snapshot. Saving twice overwrites the previous
    /// snapshot for the same id.
    pub fn save(&self, session: &ContextSession) -> Result<(), MemoryError> {
        if session.id.trim().is_empty() {
            return Err(MemoryError::InvalidInput("session id must not be empty".into()));
        }
        let messages_json = serde_json::to_string(&session.messages)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (id, created_at, updated_at, character_id, user_id, messages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session.id,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.owner.character_id,
                session.owner.user_id,
                messages_json,
            ],
        )?;
        Ok(())
    }

    /// Loads a session by id. An unknown id is `Ok(None)`, not an error.
    pub fn load(&self, session_id: &str) -> Result<Option<ContextSession>, MemoryError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, updated_at, character_id, user_id, messages
             FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query([session_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let created_at_str: String = row.get(1)?;
        let updated_at_str: String = row.get(2)?;
        let messages_json: String = row.get(5)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| MemoryError::Serialization(format!("bad created_at: {e}")))?
            .with_timezone(&chrono::Utc);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at_str)
            .map_err(|e| MemoryError::Serialization(format!("bad updated_at: {e}")))?
            .with_timezone(&chrono::Utc);

        Ok(Some(ContextSession {
            id: row.get(0)?,
            created_at,
            updated_at,
            owner: crate::memory::OwnerKey::new(row.get(3)?, row.get(4)?),
            messages: serde_json::from_str(&messages_json)?,
        }))
    }

    pub fn delete(&self, session_id: &str) -> Result<bool, MemoryError> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        Ok(changed > 0)
    }
}
