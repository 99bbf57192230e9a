//! Context API endpoints - message ingestion, compression, and session
//! lifecycle.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{bad_request, ApiError, AppState};
use crate::compression::CompressionBudget;
use crate::context_engine::{CompressionReport, CompressionTarget};
use crate::memory::{ContextSession, Message, Metadata, OwnerKey, Role};

#[derive(Debug, Deserialize)]
pub struct AddMessageRequest {
    pub session_id: String,
    pub text: String,
    pub role: String,
    pub character_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct AddMessageResponse {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct AddMessagesRequest {
    pub session_id: String,
    pub character_id: Option<String>,
    pub user_id: Option<String>,
    pub messages: Vec<BatchMessage>,
}

#[derive(Debug, Deserialize)]
pub struct BatchMessage {
    pub text: String,
    pub role: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct AddMessagesResponse {
    pub added: Vec<Message>,
    pub skipped: usize,
}

/// Compression over a stored session (`session_id`) or over raw messages
/// supplied inline (`messages`), with at most one sizing knob.
#[derive(Debug, Deserialize)]
pub struct CompressRequest {
    pub session_id: Option<String>,
    pub messages: Option<Vec<BatchMessage>>,
    pub character_id: Option<String>,
    pub user_id: Option<String>,
    pub max_messages: Option<usize>,
    pub max_chars: Option<usize>,
    pub compression_ratio: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct CompressResponse {
    pub original_length: usize,
    pub compressed_length: usize,
    pub compressed_messages: Vec<Message>,
    pub execution_time_ms: u64,
}

fn parse_role(role: &str) -> Result<Role, ApiError> {
    role.parse::<Role>().map_err(ApiError::from)
}

fn owner_from_parts(
    character_id: Option<String>,
    user_id: Option<String>,
) -> Result<OwnerKey, ApiError> {
    let owner = OwnerKey::new(character_id, user_id);
    owner.validate()?;
    Ok(owner)
}

pub async fn add_message(
    State(state): State<AppState>,
    Json(payload): Json<AddMessageRequest>,
) -> Result<Json<AddMessageResponse>, ApiError> {
    info!(
        "Add message: session={}, role={}, {} chars",
        payload.session_id,
        payload.role,
        payload.text.len()
    );
    let role = parse_role(&payload.role)?;
    let owner = owner_from_parts(payload.character_id, payload.user_id)?;
    let message = state
        .manager
        .add_message(&payload.session_id, &payload.text, role, &owner, payload.metadata)
        .await?;
    crate::metrics::inc_messages_added(role.as_str());
    crate::metrics::set_active_sessions(state.manager.active_sessions());
    Ok(Json(AddMessageResponse { message }))
}

pub async fn add_messages(
    State(state): State<AppState>,
    Json(payload): Json<AddMessagesRequest>,
) -> Result<Json<AddMessagesResponse>, ApiError> {
    if payload.messages.is_empty() {
        return Err(bad_request("messages must not be empty"));
    }
    let owner = owner_from_parts(payload.character_id, payload.user_id)?;

    let mut added = Vec::with_capacity(payload.messages.len());
    let mut skipped = 0usize;
    for item in payload.messages {
        let role = parse_role(&item.role)?;
        match state
            .manager
            .add_message(&payload.session_id, &item.text, role, &owner, item.metadata)
            .await
        {
            Ok(message) => {
                crate::metrics::inc_messages_added(role.as_str());
                added.push(message);
            }
            // A bad entry is skipped; the rest of the batch still lands.
            Err(e @ crate::error::MemoryError::DimensionMismatch { .. }) => {
                warn!("Skipping batch entry: {e}");
                skipped += 1;
            }
            Err(other) => return Err(other.into()),
        }
    }
    info!(
        "Added {} messages to session {} ({} skipped)",
        added.len(),
        payload.session_id,
        skipped
    );
    Ok(Json(AddMessagesResponse { added, skipped }))
}

pub async fn compress_session(
    State(state): State<AppState>,
    Json(payload): Json<CompressRequest>,
) -> Result<Json<CompressResponse>, ApiError> {
    let target = match (payload.max_messages, payload.max_chars, payload.compression_ratio) {
        (Some(n), None, None) => Some(CompressionTarget::Budget(CompressionBudget::Count(n))),
        (None, Some(c), None) => Some(CompressionTarget::Budget(CompressionBudget::Chars(c))),
        (None, None, Some(r)) => Some(CompressionTarget::Ratio(r)),
        (None, None, None) => None,
        _ => {
            return Err(bad_request(
                "specify at most one of max_messages, max_chars, and compression_ratio",
            ));
        }
    };

    let started = std::time::Instant::now();
    let (original_length, mut compressed_messages) = match (payload.session_id, payload.messages) {
        (Some(session_id), None) => {
            let report: CompressionReport =
                state.manager.compress_session(&session_id, target).await?;
            let messages = state
                .manager
                .load_session(&session_id)
                .await?
                .map(|s| s.messages)
                .unwrap_or_default();
            (report.messages_before, messages)
        }
        (None, Some(messages)) => {
            let owner = OwnerKey::new(payload.character_id, payload.user_id);
            let drafts = messages
                .into_iter()
                .map(|item| -> Result<Message, ApiError> {
                    let role = parse_role(&item.role)?;
                    let mut message = Message::new(&item.text, role, owner.clone());
                    message.metadata = item.metadata;
                    Ok(message)
                })
                .collect::<Result<Vec<Message>, ApiError>>()?;
            let original = drafts.len();
            let compressed = state.manager.compress_messages(drafts, target).await?;
            (original, compressed)
        }
        _ => return Err(bad_request("specify exactly one of session_id and messages")),
    };
    // Downstream consumers expect operating instructions ahead of dialog;
    // within each group chronological order is preserved.
    compressed_messages.sort_by_key(|m| m.role != Role::System);

    crate::metrics::observe_compression(started.elapsed().as_secs_f64());
    Ok(Json(CompressResponse {
        original_length,
        compressed_length: compressed_messages.len(),
        compressed_messages,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }))
}

pub async fn save_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.save_session(&session_id).await?;
    Ok(Json(serde_json::json!({ "saved": session_id })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ContextSession>, ApiError> {
    match state.manager.load_session(&session_id).await? {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError {
            status: axum::http::StatusCode::NOT_FOUND,
            message: format!("session '{session_id}' not found"),
        }),
    }
}
