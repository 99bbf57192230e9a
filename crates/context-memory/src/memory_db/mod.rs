//! Persistence layer: SQLite-backed message memories and session snapshots.

pub mod memory_store;
pub mod schema;
pub mod session_store;

pub use memory_store::MemoryStore;
pub use schema::{HybridSearchResult, MemoryRecord, SearchHit, SearchSource};
pub use session_store::SessionStore;

use crate::error::MemoryError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct MemoryDatabase {
    pub memories: MemoryStore,
    pub sessions: SessionStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(
        db_path: &Path,
        dimension: usize,
        ann_build_threshold: usize,
    ) -> Result<Self, MemoryError> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoryError::StoreUnavailable(format!("cannot create {}: {e}", parent.display())))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(10).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let db = Self::from_pool(Arc::new(pool), dimension, ann_build_threshold);
        db.memories.initialize_indexes()?;
        info!("Memory database initialized successfully");
        Ok(db)
    }

    /// In-memory database for tests. The pool is capped at a single
    /// connection: each pooled `:memory:` connection would otherwise be its
    /// own private database.
    pub fn new_in_memory(
        dimension: usize,
        ann_build_threshold: usize,
    ) -> Result<Self, MemoryError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self::from_pool(Arc::new(pool), dimension, ann_build_threshold))
    }

    fn from_pool(
        pool: Arc<Pool<SqliteConnectionManager>>,
        dimension: usize,
        ann_build_threshold: usize,
    ) -> Self {
        Self {
            memories: MemoryStore::new(Arc::clone(&pool), dimension, ann_build_threshold),
            sessions: SessionStore::new(Arc::clone(&pool)),
            pool,
        }
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ContextSession, Message, OwnerKey, Role};
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    const DIM: usize = 8;

    fn db() -> MemoryDatabase {
        MemoryDatabase::new_in_memory(DIM, 1_000_000).expect("in-memory db")
    }

    fn vec_for(seed: u64) -> Vec<f32> {
        let mut v: Vec<f32> = (0..DIM)
            .map(|i| ((seed.wrapping_mul(31).wrapping_add(i as u64)) % 97) as f32 / 97.0 + 0.01)
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn record(text: &str, owner: &OwnerKey, embedding: Vec<f32>) -> MemoryRecord {
        let mut msg = Message::new(text, Role::User, owner.clone());
        msg.embedding = Some(embedding);
        MemoryRecord::from_message(&msg).expect("record")
    }

    #[test]
    fn insert_and_get_round_trip() {
        let db = db();
        let owner = OwnerKey::new(Some("alice".into()), Some("u1".into()));
        let rec = record("remember the harbor", &owner, vec_for(1));
        db.memories.insert(&rec).unwrap();

        let fetched = db.memories.get(&rec.id).unwrap().expect("present");
        assert_eq!(fetched.text, "remember the harbor");
        assert_eq!(fetched.character_id.as_deref(), Some("alice"));
        assert_eq!(fetched.embedding, rec.embedding);
    }

    #[test]
    fn insert_rejects_wrong_dimension() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        let rec = record("short vector", &owner, vec![0.5; DIM - 1]);
        let err = db.memories.insert(&rec).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch { expected, actual }
                if expected == DIM && actual == DIM - 1
        ));
        assert_eq!(db.memories.count().unwrap(), 0);
    }

    #[test]
    fn delete_missing_returns_false() {
        let db = db();
        assert!(!db.memories.delete("no-such-id").unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        // Whatever the interleaving of inserts across owners, search under
        // an owner filter returns exactly that owner's rows.
        #[test]
        fn owner_partitions_are_isolated(
            assignments in proptest::collection::vec(0usize..4, 20..60)
        ) {
            let db = db();
            let owners: Vec<OwnerKey> = (0..4)
                .map(|i| OwnerKey::new(Some(format!("char{i}")), Some(format!("user{i}"))))
                .collect();

            let mut per_owner = vec![0usize; owners.len()];
            for (n, &who) in assignments.iter().enumerate() {
                per_owner[who] += 1;
                let rec = record(&format!("note {n}"), &owners[who], vec_for(n as u64));
                db.memories.insert(&rec).unwrap();
            }

            let query = vec_for(7);
            for (who, owner) in owners.iter().enumerate() {
                let hits = db.memories.semantic_search(&query, Some(owner), 100, 0.0).unwrap();
                prop_assert_eq!(hits.len(), per_owner[who]);
                for hit in &hits {
                    prop_assert_eq!(&hit.message.owner, owner);
                }
            }
        }
    }

    #[test]
    fn repeated_searches_return_identical_ordering() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        // Duplicate vectors with identical timestamps force every tie-break.
        let ts = Utc::now();
        for n in 0..20u64 {
            let mut rec = record(&format!("m{n}"), &owner, vec_for(n % 7));
            rec.timestamp = ts;
            db.memories.insert(&rec).unwrap();
        }

        let query = vec_for(3);
        let ids = |hits: &[SearchHit]| {
            hits.iter().map(|h| h.message.id.clone()).collect::<Vec<_>>()
        };
        let first = db.memories.semantic_search(&query, Some(&owner), 20, 0.0).unwrap();
        let second = db.memories.semantic_search(&query, Some(&owner), 20, 0.0).unwrap();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn partial_owner_filter_matches_any_missing_component() {
        let db = db();
        let a = OwnerKey::new(Some("char-a".into()), Some("shared-user".into()));
        let b = OwnerKey::new(Some("char-b".into()), Some("shared-user".into()));
        let c = OwnerKey::new(Some("char-a".into()), Some("other-user".into()));
        for (i, owner) in [&a, &b, &c].iter().enumerate() {
            db.memories
                .insert(&record(&format!("m{i}"), owner, vec_for(i as u64)))
                .unwrap();
        }

        let filter = OwnerKey::for_user("shared-user");
        let hits = db.memories.semantic_search(&vec_for(0), Some(&filter), 10, 0.0).unwrap();
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            assert_eq!(hit.message.owner.user_id.as_deref(), Some("shared-user"));
        }
    }

    #[test]
    fn semantic_search_ranks_by_similarity_then_recency() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        let query = vec_for(42);

        let mut close = record("close", &owner, query.clone());
        close.timestamp = Utc::now() - Duration::hours(2);
        let far = record("far", &owner, vec_for(99));
        db.memories.insert(&far).unwrap();
        db.memories.insert(&close).unwrap();

        let hits = db.memories.semantic_search(&query, Some(&owner), 10, 0.0).unwrap();
        assert_eq!(hits[0].message.text, "close");
        assert!(hits[0].similarity >= hits[1].similarity);

        // Equal similarity: the newer of two identical vectors wins.
        let mut old_twin = record("old twin", &owner, vec_for(42));
        old_twin.timestamp = Utc::now() - Duration::days(3);
        let new_twin = record("new twin", &owner, vec_for(42));
        db.memories.insert(&old_twin).unwrap();
        db.memories.insert(&new_twin).unwrap();

        let hits = db.memories.semantic_search(&query, Some(&owner), 2, 0.0).unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.message.text.as_str()).collect();
        assert_eq!(texts[0], "new twin");
    }

    #[test]
    fn min_importance_filters_low_scores() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        let mut low = record("low", &owner, vec_for(1));
        low.importance_score = 0.1;
        let mut high = record("high", &owner, vec_for(2));
        high.importance_score = 0.9;
        db.memories.insert(&low).unwrap();
        db.memories.insert(&high).unwrap();

        let hits = db.memories.semantic_search(&vec_for(1), Some(&owner), 10, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.text, "high");
    }

    #[test]
    fn hybrid_search_intersects_then_falls_back() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        db.memories.insert(&record("the trip to Lisbon", &owner, vec_for(1))).unwrap();
        db.memories.insert(&record("grocery list", &owner, vec_for(2))).unwrap();

        let result = db.memories
            .hybrid_search(Some(&vec_for(1)), "lisbon", Some(&owner), 5)
            .unwrap();
        assert!(!result.used_fallback);
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].source, SearchSource::Semantic);

        // Keyword with no semantic candidate containing it: keyword fallback.
        let result = db.memories
            .hybrid_search(Some(&vec_for(1)), "grocery", Some(&owner), 5)
            .unwrap();
        assert!(result.used_fallback || result.hits.iter().all(|h| h.message.text.contains("grocery")));

        // No query vector at all (embeddings down) always falls back.
        let result = db.memories.hybrid_search(None, "trip", Some(&owner), 5).unwrap();
        assert!(result.used_fallback);
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].source, SearchSource::Keyword);
    }

    #[test]
    fn hnsw_agrees_with_linear_baseline() {
        // Threshold of 64 forces the ANN path while staying fast.
        let db = MemoryDatabase::new_in_memory(DIM, 64).unwrap();
        let owner = OwnerKey::for_user("u1");
        for n in 0..300u64 {
            db.memories.insert(&record(&format!("m{n}"), &owner, vec_for(n))).unwrap();
        }

        let query = vec_for(12345);
        let ann = db.memories.semantic_search(&query, Some(&owner), 5, 0.0).unwrap();
        let exact = db.memories.semantic_search_linear(&query, Some(&owner), 5, 0.0).unwrap();

        assert_eq!(ann.len(), 5);
        // The top exact hit must appear in the ANN answer with the same score.
        let top = &exact[0];
        let found = ann.iter().find(|h| h.message.id == top.message.id);
        assert!(found.is_some(), "ANN search missed the nearest neighbor");
        assert!((found.unwrap().similarity - top.similarity).abs() < 1e-6);
    }

    #[test]
    fn index_handles_duplicate_vectors() {
        let db = MemoryDatabase::new_in_memory(DIM, 32).unwrap();
        let owner = OwnerKey::for_user("u1");
        // Many rows share the same vector; graph construction must cope and
        // search must still agree with the exact baseline.
        for n in 0..80u64 {
            db.memories.insert(&record(&format!("m{n}"), &owner, vec_for(n % 5))).unwrap();
        }

        let query = vec_for(2);
        let ann = db.memories.semantic_search(&query, Some(&owner), 5, 0.0).unwrap();
        let exact = db.memories.semantic_search_linear(&query, Some(&owner), 5, 0.0).unwrap();
        assert_eq!(ann.len(), 5);
        assert!((ann[0].similarity - exact[0].similarity).abs() < 1e-6);
    }

    #[test]
    fn rows_inserted_after_index_build_are_searchable() {
        let db = MemoryDatabase::new_in_memory(DIM, 16).unwrap();
        let owner = OwnerKey::for_user("u1");
        for n in 0..16u64 {
            db.memories.insert(&record(&format!("m{n}"), &owner, vec_for(n))).unwrap();
        }

        // The index was built at the threshold; this row lands after it and
        // must be found before the next rebuild.
        let fresh = record("fresh", &owner, vec_for(505));
        db.memories.insert(&fresh).unwrap();
        let hits = db.memories.semantic_search(&vec_for(505), Some(&owner), 1, 0.0).unwrap();
        assert_eq!(hits[0].message.text, "fresh");
    }

    #[test]
    fn update_importance_and_bounds() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        let rec = record("adjust me", &owner, vec_for(3));
        db.memories.insert(&rec).unwrap();

        assert!(db.memories.update_importance(&rec.id, 0.9).unwrap());
        let fetched = db.memories.get(&rec.id).unwrap().unwrap();
        assert!((fetched.importance_score - 0.9).abs() < 1e-6);

        assert!(!db.memories.update_importance("missing", 0.5).unwrap());
        assert!(db.memories.update_importance(&rec.id, 1.5).is_err());
    }

    #[test]
    fn delete_by_owner_clears_partition() {
        let db = db();
        let a = OwnerKey::new(Some("a".into()), Some("u".into()));
        let b = OwnerKey::new(Some("b".into()), Some("u".into()));
        for n in 0..5 {
            db.memories.insert(&record(&format!("a{n}"), &a, vec_for(n))).unwrap();
        }
        db.memories.insert(&record("keep", &b, vec_for(50))).unwrap();

        assert_eq!(db.memories.delete_by_owner(&a).unwrap(), 5);
        assert_eq!(db.memories.count().unwrap(), 1);
        let hits = db.memories.semantic_search(&vec_for(0), Some(&a), 10, 0.0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn stats_aggregate_per_owner() {
        let db = db();
        let owner = OwnerKey::for_user("u1");
        let mut early = record("early", &owner, vec_for(1));
        early.timestamp = Utc::now() - Duration::days(2);
        early.importance_score = 0.2;
        let mut late = record("late", &owner, vec_for(2));
        late.importance_score = 0.8;
        db.memories.insert(&early).unwrap();
        db.memories.insert(&late).unwrap();

        let stats = db.memories.stats(Some(&owner)).unwrap();
        assert_eq!(stats.total_memories, 2);
        assert!((stats.average_importance - 0.5).abs() < 1e-3);
        assert!(stats.earliest.unwrap() < stats.latest.unwrap());

        let empty = db.memories.stats(Some(&OwnerKey::for_user("nobody"))).unwrap();
        assert_eq!(empty.total_memories, 0);
        assert_eq!(empty.average_importance, 0.0);
        assert!(empty.earliest.is_none());
    }

    #[test]
    fn session_save_load_delete_round_trip() {
        let db = db();
        let owner = OwnerKey::new(Some("char".into()), Some("user".into()));
        let mut session = ContextSession::new("s1", owner.clone());
        session.messages.push(Message::new("hello", Role::User, owner.clone()));
        session.messages.push(Message::new("hi there", Role::Assistant, owner));

        db.sessions.save(&session).unwrap();
        let loaded = db.sessions.load("s1").unwrap().expect("saved session");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].text, "hello");
        assert_eq!(loaded.messages[1].role, Role::Assistant);

        assert!(db.sessions.load("missing").unwrap().is_none());
        assert!(db.sessions.delete("s1").unwrap());
        assert!(!db.sessions.delete("s1").unwrap());
    }

    #[test]
    fn session_save_is_an_upsert() {
        let db = db();
        let owner = OwnerKey::for_user("u");
        let mut session = ContextSession::new("s1", owner.clone());
        session.messages.push(Message::new("v1", Role::User, owner.clone()));
        db.sessions.save(&session).unwrap();

        session.messages.push(Message::new("v2", Role::User, owner));
        db.sessions.save(&session).unwrap();

        let loaded = db.sessions.load("s1").unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
    }
}
