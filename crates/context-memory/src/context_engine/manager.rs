//! Session orchestration over the scoring, compression, embedding, and
//! storage layers.
//!
//! Each active session holds its own async mutex, so appends and compression
//! for one session serialize while distinct sessions proceed concurrently.
//! Long-term persistence of appended messages happens on spawned tasks with
//! bounded retries; `flush` drains them when callers need the store settled.

use crate::compression::{CompressionBudget, CompressorConfig, SemanticCompressor};
use crate::config::Config;
use crate::embedding::{cosine_similarity, EmbeddingCache, EmbeddingProvider};
use crate::error::MemoryError;
use crate::memory::{ContextSession, Message, Metadata, OwnerKey, Role};
use crate::memory_db::{HybridSearchResult, MemoryDatabase, MemoryRecord, SearchHit};
use crate::scoring::{ImportanceScorer, ScoringConfig};
use dashmap::DashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Compressing,
    Closed,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "Active",
            SessionState::Compressing => "Compressing",
            SessionState::Closed => "Closed",
        }
    }
}

struct SessionSlot {
    session: Mutex<ContextSession>,
    state: StdMutex<SessionState>,
}

impl SessionSlot {
    fn new(session: ContextSession) -> Self {
        Self {
            session: Mutex::new(session),
            state: StdMutex::new(SessionState::Active),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

/// Restores the Active state when a compression pass unwinds early.
struct CompressingGuard<'a> {
    slot: &'a SessionSlot,
}

impl Drop for CompressingGuard<'_> {
    fn drop(&mut self) {
        self.slot.set_state(SessionState::Active);
    }
}

/// How far a compression pass should go: an explicit size budget, or a
/// fraction of the current message count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionTarget {
    Budget(CompressionBudget),
    /// Keep this fraction of the messages, in (0.0, 1.0].
    Ratio(f32),
}

/// Before/after sizes of one compression run.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CompressionReport {
    pub messages_before: usize,
    pub messages_after: usize,
    pub chars_before: usize,
    pub chars_after: usize,
}

pub struct ContextManager {
    db: Arc<MemoryDatabase>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    scorer: ImportanceScorer,
    compressor: SemanticCompressor,
    sessions: DashMap<String, Arc<SessionSlot>>,
    /// Recently closed or saved sessions, bounded; avoids a database read
    /// when a session is reopened shortly after closing.
    recent: moka::sync::Cache<String, ContextSession>,
    pending_inserts: StdMutex<Vec<JoinHandle<()>>>,
    compression_ratio: f32,
    max_context_chars: usize,
    max_search_results: usize,
    retry_attempts: usize,
    retry_backoff: Duration,
}

impl ContextManager {
    pub fn new(
        config: &Config,
        db: Arc<MemoryDatabase>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let compressor = SemanticCompressor::new(CompressorConfig {
            high_value_threshold: config.high_value_threshold,
            max_passes: config.max_compression_passes,
            ..CompressorConfig::default()
        });
        let cache = Arc::new(EmbeddingCache::new(provider.model_id()));
        Self {
            db,
            provider,
            cache,
            scorer: ImportanceScorer::new(ScoringConfig::default()),
            compressor,
            sessions: DashMap::new(),
            recent: moka::sync::Cache::new(config.session_cache_size),
            pending_inserts: StdMutex::new(Vec::new()),
            compression_ratio: config.compression_ratio,
            max_context_chars: config.max_context_chars,
            max_search_results: config.max_search_results,
            retry_attempts: config.store_retry_attempts,
            retry_backoff: Duration::from_millis(config.store_retry_backoff_ms),
        }
    }

    pub fn embedding_cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    fn slot_for(&self, session_id: &str, owner: &OwnerKey) -> Result<Arc<SessionSlot>, MemoryError> {
        if let Some(slot) = self.sessions.get(session_id) {
            let current_owner = {
                let state = slot.state();
                if state == SessionState::Closed {
                    return Err(MemoryError::InvalidSessionState {
                        session_id: session_id.to_string(),
                        state: state.as_str().to_string(),
                    });
                }
                slot.session.try_lock().map(|s| s.owner.clone()).ok()
            };
            if let Some(existing) = current_owner {
                if existing != *owner {
                    return Err(MemoryError::InvalidInput(format!(
                        "session {session_id} belongs to a different owner"
                    )));
                }
            }
            return Ok(Arc::clone(&slot));
        }

        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("Creating session {session_id}");
                Arc::new(SessionSlot::new(ContextSession::new(session_id, owner.clone())))
            });
        Ok(Arc::clone(&slot))
    }

    fn existing_slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, MemoryError> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| MemoryError::InvalidInput(format!("unknown session '{session_id}'")))
    }

    /// Appends a message to the session's working set: scores it, attaches
    /// an embedding, and schedules durable insertion into the long-term
    /// store. When the embedding backend is down the message still joins the
    /// session, stays out of long-term storage, and a warning records the
    /// degradation.
    pub async fn add_message(
        &self,
        session_id: &str,
        text: &str,
        role: Role,
        owner: &OwnerKey,
        metadata: Metadata,
    ) -> Result<Message, MemoryError> {
        owner.validate()?;
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("message text must not be empty".into()));
        }

        let slot = self.slot_for(session_id, owner)?;
        let mut session = slot.session.lock().await;

        let mut message = Message::new(text, role, owner.clone());
        message.metadata = metadata;
        message.importance_score = self.scorer.score_now(&message);

        match self.cache.get_or_compute(self.provider.as_ref(), &message.text).await {
            Ok(vector) => message.embedding = Some(vector.as_ref().clone()),
            Err(MemoryError::EmbeddingUnavailable(reason)) => {
                warn!(
                    "Embedding backend unavailable, message {} kept session-only: {}",
                    message.id, reason
                );
            }
            Err(other) => return Err(other),
        }

        session.messages.push(message.clone());
        session.updated_at = chrono::Utc::now();
        drop(session);

        if message.embedding.is_some() {
            let record = MemoryRecord::from_message(&message)?;
            self.spawn_insert(record);
        }
        Ok(message)
    }

    /// Durable insert on a spawned task. Transient store failures retry with
    /// linear backoff up to the configured attempt count; anything else is
    /// logged and dropped, the session copy remains authoritative.
    fn spawn_insert(&self, record: MemoryRecord) {
        let db = Arc::clone(&self.db);
        let attempts = self.retry_attempts.max(1);
        let backoff = self.retry_backoff;
        let handle = tokio::spawn(async move {
            for attempt in 1..=attempts {
                match db.memories.insert(&record) {
                    Ok(_) => return,
                    Err(e) if e.is_transient() && attempt < attempts => {
                        warn!("Store insert attempt {attempt} failed, retrying: {e}");
                        tokio::time::sleep(backoff * attempt as u32).await;
                    }
                    Err(e) => {
                        warn!("Dropping long-term insert for message {}: {e}", record.id);
                        return;
                    }
                }
            }
        });
        let mut pending = self.pending_inserts.lock().unwrap_or_else(|e| e.into_inner());
        // The queue lives for the process; reap settled tasks as new ones
        // arrive so it stays proportional to in-flight work.
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Waits for every scheduled long-term insert to finish. Search results
    /// only reflect appends that have been flushed (or given time to land).
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending_inserts.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Retrieves the messages most relevant to `query`, merging long-term
    /// memories with the session's working set. A message present in both
    /// keeps its session copy. Results are ranked by similarity.
    pub async fn get_relevant_memories(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>, MemoryError> {
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".into()));
        }
        let limit = if limit == 0 { self.max_search_results } else { limit };

        let slot = self.existing_slot(session_id)?;
        let (owner, working_set) = {
            let session = slot.session.lock().await;
            (session.owner.clone(), session.messages.clone())
        };

        let query_vec = self.cache.get_or_compute(self.provider.as_ref(), query).await?;

        let store_hits = self
            .db
            .memories
            .semantic_search(&query_vec, Some(&owner), limit, 0.0)?;

        // Session copies take precedence over their stored counterparts.
        let mut by_id: std::collections::HashMap<String, (f32, Message)> = std::collections::HashMap::new();
        for hit in store_hits {
            by_id.insert(hit.message.id.clone(), (hit.similarity, hit.message));
        }
        for message in working_set {
            if let Some(embedding) = &message.embedding {
                let similarity = cosine_similarity(&query_vec, embedding);
                by_id.insert(message.id.clone(), (similarity, message));
            }
        }

        let mut ranked: Vec<(f32, Message)> = by_id.into_values().collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
        });
        ranked.truncate(limit);
        Ok(ranked.into_iter().map(|(_, m)| m).collect())
    }

    /// Compresses the session's working set to `target`, defaulting to the
    /// configured ratio of the current message count. Concurrent compress
    /// calls on the same session queue on its lock and run one after the
    /// other; the later one usually finds the budget already met. The
    /// clustering itself runs on the blocking pool, so cancelling the caller
    /// abandons the pass and the working set keeps its pre-pass content.
    pub async fn compress_session(
        &self,
        session_id: &str,
        target: Option<CompressionTarget>,
    ) -> Result<CompressionReport, MemoryError> {
        let slot = self.existing_slot(session_id)?;
        let mut session = slot.session.lock().await;
        let state = slot.state();
        if state == SessionState::Closed {
            return Err(MemoryError::InvalidSessionState {
                session_id: session_id.to_string(),
                state: state.as_str().to_string(),
            });
        }
        slot.set_state(SessionState::Compressing);
        let _guard = CompressingGuard { slot: &slot };

        let before = session.messages.len();
        let chars_before = session.total_chars();
        let budget = self.resolve_target(before, chars_before, target)?;

        let compressed = self.run_compression(session.messages.clone(), budget).await?;
        let report = CompressionReport {
            messages_before: before,
            messages_after: compressed.len(),
            chars_before,
            chars_after: compressed.iter().map(|m| m.size_chars()).sum(),
        };
        session.messages = compressed;
        session.updated_at = chrono::Utc::now();
        info!(
            "Compressed session {session_id}: {} -> {} messages",
            report.messages_before, report.messages_after
        );
        Ok(report)
    }

    /// One-shot compression of caller-supplied messages. Scores and embeds
    /// them, then compresses; no session is touched and nothing is stored.
    pub async fn compress_messages(
        &self,
        mut messages: Vec<Message>,
        target: Option<CompressionTarget>,
    ) -> Result<Vec<Message>, MemoryError> {
        if messages.is_empty() {
            return Err(MemoryError::InvalidInput("messages must not be empty".into()));
        }
        for message in &mut messages {
            if message.text.trim().is_empty() {
                return Err(MemoryError::InvalidInput("message text must not be empty".into()));
            }
            message.importance_score = self.scorer.score_now(message);
            match self.cache.get_or_compute(self.provider.as_ref(), &message.text).await {
                Ok(vector) => message.embedding = Some(vector.as_ref().clone()),
                // Clustering treats a missing embedding as maximally distant.
                Err(MemoryError::EmbeddingUnavailable(_)) => {}
                Err(other) => return Err(other),
            }
        }

        let chars: usize = messages.iter().map(|m| m.size_chars()).sum();
        let budget = self.resolve_target(messages.len(), chars, target)?;
        self.run_compression(messages, budget).await
    }

    fn resolve_target(
        &self,
        count: usize,
        chars: usize,
        target: Option<CompressionTarget>,
    ) -> Result<CompressionBudget, MemoryError> {
        match target {
            Some(CompressionTarget::Budget(budget)) => Ok(budget),
            Some(CompressionTarget::Ratio(ratio)) => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(MemoryError::InvalidInput(format!(
                        "compression ratio {ratio} out of range, must be within (0.0, 1.0]"
                    )));
                }
                let kept = ((count as f32) * ratio).ceil() as usize;
                Ok(CompressionBudget::Count(kept.max(1)))
            }
            None => {
                if chars > self.max_context_chars {
                    Ok(CompressionBudget::Chars(self.max_context_chars))
                } else {
                    let kept = ((count as f32) * self.compression_ratio).ceil() as usize;
                    Ok(CompressionBudget::Count(kept.max(1)))
                }
            }
        }
    }

    /// Clustering is pure CPU work with no await points; it runs on the
    /// blocking pool so executor workers stay free to serve other requests.
    async fn run_compression(
        &self,
        messages: Vec<Message>,
        budget: CompressionBudget,
    ) -> Result<Vec<Message>, MemoryError> {
        let compressor = self.compressor.clone();
        tokio::task::spawn_blocking(move || compressor.compress_iterative(&messages, budget))
            .await
            .map_err(|e| MemoryError::Internal(format!("compression task failed: {e}")))
    }

    /// Dual-write importance update: the long-term store copy and, when the
    /// message is in an active session, the working-set copy. Without a
    /// session id every active session is scanned for the message, so the
    /// two copies never silently diverge. On a store failure the session
    /// copy is rolled back and the partial write is reported, never left
    /// split.
    pub async fn update_importance(
        &self,
        message_id: &str,
        score: f32,
        session_id: Option<&str>,
    ) -> Result<bool, MemoryError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(MemoryError::invalid_score(score));
        }

        let slots: Vec<Arc<SessionSlot>> = match session_id {
            Some(sid) => self.sessions.get(sid).map(|s| Arc::clone(&s)).into_iter().collect(),
            None => self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect(),
        };

        let mut session_rollback: Option<(Arc<SessionSlot>, f32)> = None;
        let mut session_updated = false;
        for slot in slots {
            let mut session = slot.session.lock().await;
            if let Some(message) = session.messages.iter_mut().find(|m| m.id == message_id) {
                session_rollback = Some((Arc::clone(&slot), message.importance_score));
                message.importance_score = score;
                session_updated = true;
                break;
            }
        }

        match self.db.memories.update_importance(message_id, score) {
            Ok(store_updated) => Ok(store_updated || session_updated),
            Err(e) => {
                if let Some((slot, previous)) = session_rollback {
                    let mut session = slot.session.lock().await;
                    if let Some(message) = session.messages.iter_mut().find(|m| m.id == message_id) {
                        message.importance_score = previous;
                    }
                    return Err(MemoryError::ConsistencyError(format!(
                        "importance update for {message_id} failed after session write, rolled back: {e}"
                    )));
                }
                Err(e)
            }
        }
    }

    /// Hybrid retrieval over the long-term store: semantic neighbors of
    /// `query` filtered by `keyword_filter` (or by the query text itself
    /// when no filter is given). An unreachable embedding backend degrades
    /// to keyword-only, flagged through `used_fallback`.
    pub async fn hybrid_search(
        &self,
        query: &str,
        keyword_filter: Option<&str>,
        owner: Option<&OwnerKey>,
        limit: usize,
    ) -> Result<HybridSearchResult, MemoryError> {
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".into()));
        }
        let limit = if limit == 0 { self.max_search_results } else { limit };
        let keyword = keyword_filter.filter(|k| !k.trim().is_empty()).unwrap_or(query);

        let query_vec = match self.cache.get_or_compute(self.provider.as_ref(), query).await {
            Ok(v) => Some(v),
            Err(MemoryError::EmbeddingUnavailable(reason)) => {
                warn!("Hybrid search degrading to keyword-only: {reason}");
                None
            }
            Err(other) => return Err(other),
        };
        self.db
            .memories
            .hybrid_search(query_vec.as_ref().map(|v| v.as_slice()), keyword, owner, limit)
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        owner: Option<&OwnerKey>,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".into()));
        }
        let limit = if limit == 0 { self.max_search_results } else { limit };
        let query_vec = self.cache.get_or_compute(self.provider.as_ref(), query).await?;
        self.db.memories.semantic_search(&query_vec, owner, limit, min_importance)
    }

    /// Persists the session snapshot and caches it for quick reopening.
    pub async fn save_session(&self, session_id: &str) -> Result<(), MemoryError> {
        let slot = self.existing_slot(session_id)?;
        let snapshot = {
            let mut session = slot.session.lock().await;
            session.updated_at = chrono::Utc::now();
            session.clone()
        };
        self.db.sessions.save(&snapshot)?;
        self.recent.insert(session_id.to_string(), snapshot);
        Ok(())
    }

    /// Reopens a session: active slot first, then the recent cache, then the
    /// database. Unknown ids are `Ok(None)`.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<ContextSession>, MemoryError> {
        if let Some(slot) = self.sessions.get(session_id).map(|s| Arc::clone(&s)) {
            if slot.state() != SessionState::Closed {
                return Ok(Some(slot.session.lock().await.clone()));
            }
        }

        let restored = match self.recent.get(session_id) {
            Some(cached) => {
                debug!("Session {session_id} restored from recent cache");
                Some(cached)
            }
            None => self.db.sessions.load(session_id)?,
        };
        let Some(session) = restored else {
            return Ok(None);
        };

        self.sessions
            .insert(session_id.to_string(), Arc::new(SessionSlot::new(session.clone())));
        Ok(Some(session))
    }

    /// Saves, evicts from the active map, and marks the slot Closed. Later
    /// appends under this id must reopen it through `load_session`.
    pub async fn close_session(&self, session_id: &str) -> Result<(), MemoryError> {
        self.save_session(session_id).await?;
        if let Some((_, slot)) = self.sessions.remove(session_id) {
            slot.set_state(SessionState::Closed);
        }
        info!("Session {session_id} closed");
        Ok(())
    }

    pub fn delete_memory(&self, memory_id: &str) -> Result<bool, MemoryError> {
        self.db.memories.delete(memory_id)
    }

    pub fn stats(&self, owner: Option<&OwnerKey>) -> Result<crate::memory::MemoryStats, MemoryError> {
        self.db.memories.stats(owner)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbeddingProvider;
    use async_trait::async_trait;

    const DIM: usize = 16;

    struct DownProvider;

    #[async_trait]
    impl EmbeddingProvider for DownProvider {
        fn dimension(&self) -> usize {
            DIM
        }
        fn model_id(&self) -> &str {
            "down"
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
            Err(MemoryError::EmbeddingUnavailable("connection refused".into()))
        }
    }

    fn test_config() -> Config {
        Config {
            embedding_dimension: DIM,
            ann_build_threshold: 1_000_000,
            ..Config::default()
        }
    }

    fn manager() -> ContextManager {
        let config = test_config();
        let db = Arc::new(MemoryDatabase::new_in_memory(DIM, config.ann_build_threshold).unwrap());
        let provider = Arc::new(HashedEmbeddingProvider::new(DIM));
        ContextManager::new(&config, db, provider)
    }

    fn degraded_manager() -> ContextManager {
        let config = test_config();
        let db = Arc::new(MemoryDatabase::new_in_memory(DIM, config.ann_build_threshold).unwrap());
        ContextManager::new(&config, db, Arc::new(DownProvider))
    }

    fn owner() -> OwnerKey {
        OwnerKey::new(Some("char1".into()), Some("user1".into()))
    }

    #[tokio::test]
    async fn add_message_scores_and_persists() {
        let mgr = manager();
        let msg = mgr
            .add_message("s1", "I'm so excited about my trip on March 3rd!", Role::User, &owner(), Metadata::new())
            .await
            .unwrap();
        assert!(msg.importance_score > 0.0 && msg.importance_score <= 1.0);
        assert!(msg.embedding.is_some());

        mgr.flush().await;
        assert_eq!(mgr.database().memories.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn add_message_rejects_empty_text_and_ownerless_key() {
        let mgr = manager();
        assert!(mgr
            .add_message("s1", "   ", Role::User, &owner(), Metadata::new())
            .await
            .is_err());
        assert!(mgr
            .add_message("s1", "hello", Role::User, &OwnerKey::default(), Metadata::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn embedding_outage_degrades_to_session_only() {
        let mgr = degraded_manager();
        let msg = mgr
            .add_message("s1", "remember the blue door", Role::User, &owner(), Metadata::new())
            .await
            .unwrap();
        assert!(msg.embedding.is_none());

        mgr.flush().await;
        assert_eq!(mgr.database().memories.count().unwrap(), 0);

        // Hybrid search still answers, flagged as keyword fallback.
        let result = mgr.hybrid_search("door", None, Some(&owner()), 5).await.unwrap();
        assert!(result.used_fallback);
    }

    #[tokio::test]
    async fn relevant_memories_prefer_session_copies() {
        let mgr = manager();
        let who = owner();
        let msg = mgr
            .add_message("s1", "the harbor lighthouse is red", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.flush().await;

        // Diverge the session copy from the stored one.
        mgr.update_importance(&msg.id, 0.95, Some("s1")).await.unwrap();

        let results = mgr
            .get_relevant_memories("s1", "the harbor lighthouse is red", 5)
            .await
            .unwrap();
        let found: Vec<&Message> = results.iter().filter(|m| m.id == msg.id).collect();
        assert_eq!(found.len(), 1, "session and store copies must deduplicate");
        assert!((found[0].importance_score - 0.95).abs() < 1e-6);
    }

    #[tokio::test]
    async fn compress_session_meets_count_budget() {
        let mgr = manager();
        let who = owner();
        mgr.add_message("s1", "You are a helpful assistant.", Role::System, &who, Metadata::new())
            .await
            .unwrap();
        for n in 0..8 {
            mgr.add_message("s1", &format!("casual chatter number {n}"), Role::User, &who, Metadata::new())
                .await
                .unwrap();
        }

        let report = mgr
            .compress_session("s1", Some(CompressionTarget::Budget(CompressionBudget::Count(4))))
            .await
            .unwrap();
        assert!(report.messages_after <= 4);
        assert!(report.messages_after < report.messages_before);

        // System message survives every pass.
        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert!(session.messages.iter().any(|m| m.role == Role::System));
    }

    #[tokio::test]
    async fn update_importance_rejects_out_of_range_scores() {
        let mgr = manager();
        let who = owner();
        let msg = mgr
            .add_message("s1", "keep this score intact", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.flush().await;
        let original = msg.importance_score;

        for bad in [-0.1_f32, 1.1_f32] {
            let err = mgr.update_importance(&msg.id, bad, Some("s1")).await.unwrap_err();
            assert!(matches!(err, MemoryError::InvalidInput(_)));
        }

        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert!((session.messages[0].importance_score - original).abs() < 1e-6);
        let stored = mgr.database().memories.get(&msg.id).unwrap().unwrap();
        assert!((stored.importance_score - original).abs() < 1e-6);
    }

    #[tokio::test]
    async fn update_importance_is_true_on_session_only_hit() {
        let mgr = degraded_manager();
        let who = owner();
        let msg = mgr
            .add_message("s1", "session only message", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        // Not in the store (no embedding) but present in the session.
        assert!(mgr.update_importance(&msg.id, 0.7, Some("s1")).await.unwrap());
        assert!(!mgr.update_importance("missing-id", 0.7, None).await.unwrap());
    }

    #[tokio::test]
    async fn save_close_and_reload_round_trip() {
        let mgr = manager();
        let who = owner();
        mgr.add_message("s1", "first", Role::User, &who, Metadata::new()).await.unwrap();
        mgr.add_message("s1", "second", Role::Assistant, &who, Metadata::new()).await.unwrap();

        mgr.close_session("s1").await.unwrap();
        assert_eq!(mgr.active_sessions(), 0);

        // Reopening installs an active slot again, and appends continue
        // from the persisted working set.
        let reloaded = mgr.load_session("s1").await.unwrap().expect("persisted session");
        assert_eq!(reloaded.messages.len(), 2);
        assert_eq!(reloaded.messages[1].text, "second");

        mgr.add_message("s1", "third", Role::User, &who, Metadata::new()).await.unwrap();
        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 3);
    }

    #[tokio::test]
    async fn load_unknown_session_is_none() {
        let mgr = manager();
        assert!(mgr.load_session("never-created").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_rejects_foreign_owner() {
        let mgr = manager();
        mgr.add_message("s1", "mine", Role::User, &owner(), Metadata::new()).await.unwrap();
        let intruder = OwnerKey::for_user("someone-else");
        let err = mgr
            .add_message("s1", "theirs", Role::User, &intruder, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let mgr = Arc::new(manager());
        let who = owner();
        let mut handles = Vec::new();
        for n in 0..20 {
            let mgr = Arc::clone(&mgr);
            let who = who.clone();
            handles.push(tokio::spawn(async move {
                mgr.add_message("s1", &format!("burst message {n}"), Role::User, &who, Metadata::new())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        mgr.flush().await;

        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 20);
        assert_eq!(mgr.database().memories.count().unwrap(), 20);
    }

    #[tokio::test]
    async fn dense_message_survives_compression_and_is_findable() {
        let mgr = manager();
        let who = owner();
        for text in [
            "Hello",
            "I'm so excited about my trip on March 3rd!",
            "That's great!",
        ] {
            mgr.add_message("s1", text, Role::User, &who, Metadata::new()).await.unwrap();
        }
        mgr.flush().await;

        let report = mgr
            .compress_session("s1", Some(CompressionTarget::Budget(CompressionBudget::Count(2))))
            .await
            .unwrap();
        assert!(report.messages_after <= 2);
        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert!(
            session.messages.iter().any(|m| m.text.contains("March 3rd")),
            "highest-importance message must survive"
        );

        for query in ["trip", "March"] {
            let result = mgr.hybrid_search(query, None, Some(&who), 5).await.unwrap();
            assert!(!result.used_fallback, "semantic path expected for '{query}'");
            assert!(result.hits.iter().any(|h| h.message.text.contains("March 3rd")));
        }
    }

    #[tokio::test]
    async fn hybrid_search_end_to_end() {
        let mgr = manager();
        let who = owner();
        mgr.add_message("s1", "we sailed to Lisbon last summer", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.add_message("s1", "buy milk and eggs", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.flush().await;

        let result = mgr.hybrid_search("lisbon", None, Some(&who), 5).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].message.text.contains("Lisbon"));
    }

    #[tokio::test]
    async fn hybrid_keyword_filter_narrows_semantic_hits() {
        let mgr = manager();
        let who = owner();
        mgr.add_message("s1", "I love this trip so much", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.add_message("s1", "I'm so excited about my trip on March 3rd!", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.flush().await;

        // The embedding query and the keyword constraint are independent:
        // "trip" matches both rows semantically, the filter keeps only the
        // one mentioning March.
        let result = mgr.hybrid_search("trip", Some("March"), Some(&who), 5).await.unwrap();
        assert!(!result.used_fallback);
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].message.text.contains("March 3rd"));
    }

    #[tokio::test]
    async fn importance_update_without_session_reaches_working_copy() {
        let mgr = manager();
        let who = owner();
        let msg = mgr
            .add_message("s1", "keep both copies aligned", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        mgr.flush().await;

        assert!(mgr.update_importance(&msg.id, 0.9, None).await.unwrap());

        let stored = mgr.database().memories.get(&msg.id).unwrap().unwrap();
        assert!((stored.importance_score - 0.9).abs() < 1e-6);
        let session = mgr.load_session("s1").await.unwrap().unwrap();
        let copy = session.messages.iter().find(|m| m.id == msg.id).unwrap();
        assert!((copy.importance_score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn concurrent_compress_calls_serialize() {
        let mgr = Arc::new(manager());
        let who = owner();
        for n in 0..9 {
            mgr.add_message("s1", &format!("filler line number {n}"), Role::User, &who, Metadata::new())
                .await
                .unwrap();
        }

        let target = Some(CompressionTarget::Budget(CompressionBudget::Count(4)));
        let first = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.compress_session("s1", target).await })
        };
        let second = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.compress_session("s1", target).await })
        };
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert!(session.messages.len() <= 4);
    }

    #[tokio::test]
    async fn compress_with_ratio_keeps_a_fraction() {
        let mgr = manager();
        let who = owner();
        for n in 0..8 {
            mgr.add_message("s1", &format!("note about errand number {n}"), Role::User, &who, Metadata::new())
                .await
                .unwrap();
        }

        let report = mgr
            .compress_session("s1", Some(CompressionTarget::Ratio(0.5)))
            .await
            .unwrap();
        assert!(report.messages_after <= 4);

        let err = mgr
            .compress_session("s1", Some(CompressionTarget::Ratio(1.5)))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn compress_messages_is_stateless() {
        let mgr = manager();
        let who = owner();
        let drafts: Vec<Message> = [
            "Hello",
            "I'm so excited about my trip on March 3rd!",
            "That's great!",
        ]
        .iter()
        .map(|text| Message::new(*text, Role::User, who.clone()))
        .collect();

        let out = mgr
            .compress_messages(drafts, Some(CompressionTarget::Budget(CompressionBudget::Count(2))))
            .await
            .unwrap();
        assert!(out.len() <= 2);
        assert!(out.iter().any(|m| m.text.contains("March 3rd")));

        // Nothing was stored and no session was opened.
        assert_eq!(mgr.active_sessions(), 0);
        assert_eq!(mgr.database().memories.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn finished_insert_tasks_are_reaped_on_later_appends() {
        let mgr = manager();
        let who = owner();
        for n in 0..5 {
            mgr.add_message("s1", &format!("durable note {n}"), Role::User, &who, Metadata::new())
                .await
                .unwrap();
        }
        // Let the spawned inserts settle without draining the queue.
        while mgr.database().memories.count().unwrap() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        mgr.add_message("s1", "one more", Role::User, &who, Metadata::new())
            .await
            .unwrap();
        let pending = mgr.pending_inserts.lock().unwrap().len();
        assert!(pending <= 1, "settled insert tasks still queued: {pending}");
    }
}
