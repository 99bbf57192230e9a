//! API module - HTTP boundary over the context engine

pub mod context_api;
pub mod memory_api;
pub mod search_api;

pub use context_api::{add_message, add_messages, compress_session, get_session, save_session};
pub use memory_api::{delete_memory, memory_stats, update_importance};
pub use search_api::{hybrid_search, semantic_search};

use crate::context_engine::ContextManager;
use crate::error::MemoryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContextManager>,
}

/// Maps engine errors onto HTTP status codes. Validation failures are the
/// caller's fault; backend outages are reported as 503 so clients can retry.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        let status = match &e {
            MemoryError::InvalidInput(_) | MemoryError::DimensionMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            MemoryError::InvalidSessionState { .. } => StatusCode::CONFLICT,
            MemoryError::EmbeddingUnavailable(_) | MemoryError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            MemoryError::ConsistencyError(_)
            | MemoryError::Internal(_)
            | MemoryError::Storage(_)
            | MemoryError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: e.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError { status: StatusCode::BAD_REQUEST, message: message.into() }
}
