//! Search API endpoints - semantic and hybrid retrieval over long-term
//! memory.
//!
//! A hybrid query embeds the text, intersects semantic neighbors with a
//! keyword filter, and falls back to keyword-only matches when the
//! embedding backend is down; the response says which path produced it.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{bad_request, ApiError, AppState};
use crate::memory::OwnerKey;
use crate::memory_db::SearchHit;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    /// Keyword constraint for hybrid search; defaults to the query text.
    pub keyword_filter: Option<String>,
    pub character_id: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
    pub min_importance: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub total: usize,
    /// "semantic" or "keyword", depending on which path answered.
    pub search_type: String,
    /// True when the keyword fallback answered instead of the semantic path.
    pub used_fallback: bool,
    pub execution_time_ms: u64,
}

fn optional_owner(
    character_id: Option<String>,
    user_id: Option<String>,
) -> Option<OwnerKey> {
    if character_id.is_none() && user_id.is_none() {
        None
    } else {
        Some(OwnerKey::new(character_id, user_id))
    }
}

pub async fn semantic_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = params.limit.unwrap_or(0).min(100);
    let owner = optional_owner(params.character_id, params.user_id);

    info!("Semantic search: q='{}', limit={}", params.q, limit);
    let started = std::time::Instant::now();
    let results = state
        .manager
        .semantic_search(
            &params.q,
            owner.as_ref(),
            limit,
            params.min_importance.unwrap_or(0.0),
        )
        .await?;
    let total = results.len();
    crate::metrics::inc_search("semantic");
    crate::metrics::observe_search(started.elapsed().as_secs_f64());
    Ok(Json(SearchResponse {
        query: params.q,
        results,
        total,
        search_type: "semantic".into(),
        used_fallback: false,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }))
}

pub async fn hybrid_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = params.limit.unwrap_or(0).min(100);
    let owner = optional_owner(params.character_id, params.user_id);

    info!("Hybrid search: q='{}', limit={}", params.q, limit);
    let started = std::time::Instant::now();
    let result = state
        .manager
        .hybrid_search(&params.q, params.keyword_filter.as_deref(), owner.as_ref(), limit)
        .await?;
    let total = result.hits.len();
    let search_type = if result.used_fallback { "keyword" } else { "semantic" };
    crate::metrics::inc_search(search_type);
    crate::metrics::observe_search(started.elapsed().as_secs_f64());
    Ok(Json(SearchResponse {
        query: params.q,
        results: result.hits,
        total,
        search_type: search_type.into(),
        used_fallback: result.used_fallback,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_carries_fallback_flag() {
        let response = SearchResponse {
            query: "trip".into(),
            results: Vec::new(),
            total: 0,
            search_type: "keyword".into(),
            used_fallback: true,
            execution_time_ms: 3,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["used_fallback"], serde_json::Value::Bool(true));
        assert_eq!(json["search_type"], "keyword");
    }
}
