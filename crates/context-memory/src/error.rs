//! Error taxonomy for the context-memory engine.
//!
//! Every fallible library operation returns `Result<T, MemoryError>`. Empty
//! search results are a successful response, never an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed input rejected synchronously and never retried: a score
    /// outside [0,1], an owner key with neither component, an empty query.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A vector whose length does not match the store's configured dimension.
    /// Fatal for that entry only; batch inserts continue with the rest.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding backend is unreachable. Callers degrade to keyword-only
    /// behavior and surface the fallback flag instead of faking a zero vector.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Transient storage failure. Durable operations are retried with backoff
    /// up to a bounded attempt count before this is reported.
    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    /// The dual write in an importance update partially failed. The original
    /// score is preserved on both sides before this is surfaced.
    #[error("consistency error: {0}")]
    ConsistencyError(String),

    /// A compress was requested while the session is not in the Active state.
    #[error("session {session_id} is {state}, expected Active")]
    InvalidSessionState { session_id: String, state: String },

    /// A background task backing the operation failed or was torn down.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        MemoryError::StoreUnavailable(e.to_string())
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

impl MemoryError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, MemoryError::StoreUnavailable(_))
    }

    pub fn invalid_score(score: f32) -> Self {
        MemoryError::InvalidInput(format!(
            "importance score {score} out of range, must be within [0.0, 1.0]"
        ))
    }
}
