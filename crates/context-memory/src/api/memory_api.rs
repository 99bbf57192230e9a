//! Memory API endpoints - per-entry maintenance and partition statistics.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::api::{ApiError, AppState};
use crate::memory::{MemoryStats, OwnerKey};

#[derive(Debug, Deserialize)]
pub struct OwnerParams {
    pub character_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateImportanceRequest {
    pub score: f32,
    pub session_id: Option<String>,
}

pub async fn memory_stats(
    State(state): State<AppState>,
    Query(params): Query<OwnerParams>,
) -> Result<Json<MemoryStats>, ApiError> {
    let owner = if params.character_id.is_none() && params.user_id.is_none() {
        None
    } else {
        Some(OwnerKey::new(params.character_id, params.user_id))
    };
    let stats = state.manager.stats(owner.as_ref())?;
    Ok(Json(stats))
}

pub async fn delete_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.manager.delete_memory(&memory_id)?;
    if !deleted {
        return Err(ApiError {
            status: axum::http::StatusCode::NOT_FOUND,
            message: format!("memory '{memory_id}' not found"),
        });
    }
    info!("Deleted memory {memory_id}");
    Ok(Json(serde_json::json!({ "deleted": memory_id })))
}

/// Score range violations surface as 400 before any state changes.
pub async fn update_importance(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
    Json(payload): Json<UpdateImportanceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state
        .manager
        .update_importance(&memory_id, payload.score, payload.session_id.as_deref())
        .await?;
    if !updated {
        return Err(ApiError {
            status: axum::http::StatusCode::NOT_FOUND,
            message: format!("memory '{memory_id}' not found"),
        });
    }
    Ok(Json(serde_json::json!({ "updated": memory_id, "score": payload.score })))
}
