//! Vector memory store: owner-partitioned persistence with semantic and
//! hybrid retrieval.
//!
//! SQLite is the source of truth; per-partition vectors are mirrored in
//! memory and promoted to an HNSW index once a partition outgrows
//! `ann_build_threshold`. Smaller partitions use an exact scan, which is
//! also the correctness baseline any index result is validated against.

use crate::embedding::cosine_similarity;
use crate::error::MemoryError;
use crate::memory::{MemoryStats, OwnerKey};
use crate::memory_db::schema::{HybridSearchResult, MemoryRecord, SearchHit, SearchSource};
use dashmap::DashMap;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows accumulated past the last index build before the graph is rebuilt.
/// In between, the newer rows are covered by an exact scan.
const INDEX_REBUILD_BATCH: usize = 64;

struct PartitionIndex {
    /// Mirror of every vector in the partition, keyed by insertion sequence.
    vectors: HashMap<i64, Vec<f32>>,
    /// Built lazily once the partition crosses the ANN threshold.
    hnsw: Option<HNSWIndex<f32, i64>>,
    /// Highest sequence contained in `hnsw`; later rows are scanned exactly.
    indexed_through: i64,
    /// Inserts since the last build.
    stale: usize,
}

impl PartitionIndex {
    fn new() -> Self {
        Self { vectors: HashMap::new(), hnsw: None, indexed_through: 0, stale: 0 }
    }
}

pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    dimension: usize,
    ann_build_threshold: usize,
    partitions: DashMap<String, PartitionIndex>,
}

impl MemoryStore {
    pub fn new(
        pool: Arc<Pool<SqliteConnectionManager>>,
        dimension: usize,
        ann_build_threshold: usize,
    ) -> Self {
        Self {
            pool,
            dimension,
            ann_build_threshold,
            partitions: DashMap::new(),
        }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, MemoryError> {
        self.pool.get().map_err(MemoryError::from)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Loads every stored vector into the per-partition mirrors and builds
    /// HNSW indexes for partitions above the threshold. Called once at
    /// startup so semantic search is available immediately.
    pub fn initialize_indexes(&self) -> Result<usize, MemoryError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT seq, partition, embedding FROM memories")?;
        let mut rows = stmt.query([])?;
        let mut loaded = 0usize;
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let partition: String = row.get(1)?;
            let bytes: Vec<u8> = row.get(2)?;
            let vector: Vec<f32> = bincode::deserialize(&bytes)?;
            self.partitions
                .entry(partition)
                .or_insert_with(PartitionIndex::new)
                .vectors
                .insert(seq, vector);
            loaded += 1;
        }
        drop(rows);
        drop(stmt);

        for mut entry in self.partitions.iter_mut() {
            self.rebuild_hnsw(entry.value_mut());
        }
        if loaded > 0 {
            info!("Memory index initialized with {} vectors", loaded);
        }
        Ok(loaded)
    }

    fn rebuild_hnsw(&self, partition: &mut PartitionIndex) {
        partition.hnsw = None;
        partition.indexed_through = 0;
        partition.stale = 0;
        if partition.vectors.len() < self.ann_build_threshold {
            return;
        }
        let params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        // The graph is built over unit vectors under Euclidean distance,
        // which preserves cosine nearest-neighbor order. Duplicate rows,
        // common in real data, produce NaN edge weights under the cosine
        // metric during construction and abort the build inside the library.
        let rows: Vec<(i64, Vec<f32>)> = partition
            .vectors
            .iter()
            .map(|(seq, vector)| (*seq, l2_normalize(vector)))
            .collect();
        let dimension = self.dimension;
        let built = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut index = HNSWIndex::<f32, i64>::new(dimension, &params);
            for (seq, vector) in &rows {
                index.add(vector, *seq)?;
            }
            index.build(Metric::Euclidean)?;
            Ok::<_, &'static str>(index)
        }));
        match built {
            Ok(Ok(index)) => {
                debug!("HNSW index built over {} vectors", partition.vectors.len());
                partition.indexed_through = partition.vectors.keys().copied().max().unwrap_or(0);
                partition.hnsw = Some(index);
            }
            Ok(Err(e)) => {
                warn!("Failed to build HNSW index, staying on linear scan: {}", e);
            }
            Err(_) => {
                warn!("HNSW construction panicked, staying on linear scan");
            }
        }
    }

    /// Persists a record and returns its assigned insertion sequence.
    /// Dimension is validated before any write happens.
    pub fn insert(&self, record: &MemoryRecord) -> Result<i64, MemoryError> {
        self.check_dimension(&record.embedding)?;

        let embedding_bytes = bincode::serialize(&record.embedding)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO memories
             (id, text, role, character_id, user_id, partition, timestamp, importance_score, embedding, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                record.id,
                record.text,
                record.role.as_str(),
                record.character_id,
                record.user_id,
                record.partition,
                record.timestamp.to_rfc3339(),
                record.importance_score,
                embedding_bytes,
                metadata_json,
            ],
        )?;
        let seq = conn.last_insert_rowid();

        let mut partition = self
            .partitions
            .entry(record.partition.clone())
            .or_insert_with(PartitionIndex::new);
        partition.vectors.insert(seq, record.embedding.clone());
        if partition.hnsw.is_some() {
            partition.stale += 1;
        }
        // A full rebuild per insert would stall searches on the partition;
        // rebuild on crossing the threshold, then in batches, with the
        // unindexed tail scanned exactly in the meantime.
        let needs_build = match &partition.hnsw {
            None => partition.vectors.len() >= self.ann_build_threshold,
            Some(_) => partition.stale >= INDEX_REBUILD_BATCH,
        };
        if needs_build {
            self.rebuild_hnsw(partition.value_mut());
        }
        Ok(seq)
    }

    /// Removes an entry. Returns false, not an error, for a missing id.
    pub fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let conn = self.get_conn()?;
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT seq, partition FROM memories WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((seq, partition_key)) = existing else {
            return Ok(false);
        };

        conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
        if let Some(mut partition) = self.partitions.get_mut(&partition_key) {
            partition.vectors.remove(&seq);
            if partition.hnsw.is_some() {
                // hora has no removal; rebuild from the surviving vectors.
                self.rebuild_hnsw(partition.value_mut());
            }
        }
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} WHERE id = ?1"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Cosine-ranked retrieval over the owner's partition(s), or globally
    /// when no filter is given. Descending similarity, ties broken by the
    /// more recent timestamp.
    pub fn semantic_search(
        &self,
        query: &[f32],
        owner: Option<&OwnerKey>,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        self.check_dimension(query)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Gather (seq, similarity) candidates per matching partition.
        let mut candidates: Vec<(i64, f32)> = Vec::new();
        for entry in self.partitions.iter() {
            if !partition_matches(entry.key(), owner) {
                continue;
            }
            let partition = entry.value();
            match &partition.hnsw {
                Some(index) => {
                    // Over-fetch, then rescore with exact cosine. The graph
                    // holds unit vectors, so the query is normalized too.
                    let found = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        index.search(&l2_normalize(query), (limit * 4).max(16))
                    }));
                    match found {
                        Ok(seqs) => {
                            for seq in seqs {
                                if let Some(vector) = partition.vectors.get(&seq) {
                                    candidates.push((seq, cosine_similarity(query, vector)));
                                }
                            }
                            // Rows newer than the last build are not in the
                            // graph yet.
                            for (seq, vector) in &partition.vectors {
                                if *seq > partition.indexed_through {
                                    candidates.push((*seq, cosine_similarity(query, vector)));
                                }
                            }
                        }
                        Err(_) => {
                            warn!("HNSW search panicked, answering from exact scan");
                            for (seq, vector) in &partition.vectors {
                                candidates.push((*seq, cosine_similarity(query, vector)));
                            }
                        }
                    }
                }
                None => {
                    for (seq, vector) in &partition.vectors {
                        candidates.push((*seq, cosine_similarity(query, vector)));
                    }
                }
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = self.hydrate(&candidates)?;
        hits.retain(|h| h.message.importance_score >= min_importance);
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Exact full-scan baseline. Identical contract to `semantic_search`;
    /// kept as the reference any index path is validated against.
    pub fn semantic_search_linear(
        &self,
        query: &[f32],
        owner: Option<&OwnerKey>,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        self.check_dimension(query)?;
        let conn = self.get_conn()?;
        let (clause, params) = owner_filter_clause(owner);
        let sql = format!("{SELECT_RECORD} {clause}");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            if record.importance_score < min_importance {
                continue;
            }
            let similarity = cosine_similarity(query, &record.embedding);
            hits.push(SearchHit {
                message: record.into_message(),
                similarity,
                source: SearchSource::Semantic,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Case-insensitive substring match ranked by recency.
    pub fn keyword_search(
        &self,
        keyword: &str,
        owner: Option<&OwnerKey>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let conn = self.get_conn()?;
        let (clause, mut params) = owner_filter_clause(owner);
        let connector = if clause.is_empty() { "WHERE" } else { "AND" };
        let sql = format!(
            "{SELECT_RECORD} {clause} {connector} lower(text) LIKE ?{} ORDER BY timestamp DESC, seq DESC LIMIT {limit}",
            params.len() + 1,
        );
        params.push(format!("%{}%", keyword.to_lowercase()));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            hits.push(SearchHit {
                message: record.into_message(),
                similarity: 0.0,
                source: SearchSource::Keyword,
            });
        }
        Ok(hits)
    }

    /// Semantic candidates intersected with a keyword filter. An empty
    /// intersection, or an absent query vector when embeddings are down,
    /// falls back to keyword-only matches ranked by recency, and the
    /// fallback is flagged so it is never mistaken for a semantic match.
    pub fn hybrid_search(
        &self,
        query: Option<&[f32]>,
        keyword: &str,
        owner: Option<&OwnerKey>,
        limit: usize,
    ) -> Result<HybridSearchResult, MemoryError> {
        if let Some(query_vec) = query {
            // Over-fetch semantic candidates to survive the keyword filter.
            let mut hits = self.semantic_search(query_vec, owner, limit * 2, 0.0)?;
            let needle = keyword.to_lowercase();
            hits.retain(|h| h.message.text.to_lowercase().contains(&needle));
            if !hits.is_empty() {
                hits.truncate(limit);
                return Ok(HybridSearchResult { hits, used_fallback: false });
            }
        }

        let hits = self.keyword_search(keyword, owner, limit)?;
        Ok(HybridSearchResult { hits, used_fallback: true })
    }

    /// Aggregate over an owner's partition(s); recomputed on demand.
    pub fn stats(&self, owner: Option<&OwnerKey>) -> Result<MemoryStats, MemoryError> {
        let conn = self.get_conn()?;
        let (clause, params) = owner_filter_clause(owner);
        let sql = format!(
            "SELECT COUNT(*), AVG(importance_score), MIN(timestamp), MAX(timestamp)
             FROM memories {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let (count, avg, earliest, latest): (i64, Option<f64>, Option<String>, Option<String>) =
            stmt.query_row(rusqlite::params_from_iter(params.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

        Ok(MemoryStats {
            total_memories: count as usize,
            average_importance: avg.unwrap_or(0.0) as f32,
            earliest: earliest.as_deref().and_then(parse_ts),
            latest: latest.as_deref().and_then(parse_ts),
            character_id: owner.and_then(|o| o.character_id.clone()),
            user_id: owner.and_then(|o| o.user_id.clone()),
        })
    }

    /// Updates the persisted importance score. Returns false when the id is
    /// unknown. The score must be within [0,1].
    pub fn update_importance(&self, id: &str, score: f32) -> Result<bool, MemoryError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(MemoryError::invalid_score(score));
        }
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE memories SET importance_score = ?1 WHERE id = ?2",
            rusqlite::params![score, id],
        )?;
        Ok(changed > 0)
    }

    /// Removes every entry owned by `owner`; returns the deleted count.
    pub fn delete_by_owner(&self, owner: &OwnerKey) -> Result<usize, MemoryError> {
        owner.validate()?;
        let partition_key = owner.partition();
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM memories WHERE partition = ?1",
            [&partition_key],
        )?;
        self.partitions.remove(&partition_key);
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize, MemoryError> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Fetches full records for scored candidates and attaches similarity.
    fn hydrate(&self, candidates: &[(i64, f32)]) -> Result<Vec<SearchHit>, MemoryError> {
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; candidates.len()].join(",");
        let sql = format!("{SELECT_RECORD} WHERE seq IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let seqs: Vec<i64> = candidates.iter().map(|(seq, _)| *seq).collect();
        let similarity_by_seq: HashMap<i64, f32> = candidates.iter().copied().collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(seqs.iter()))?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let record = row_to_record(row)?;
            let similarity = similarity_by_seq.get(&record.seq).copied().unwrap_or(0.0);
            hits.push(SearchHit {
                message: record.into_message(),
                similarity,
                source: SearchSource::Semantic,
            });
        }
        Ok(hits)
    }
}

const SELECT_RECORD: &str =
    "SELECT seq, id, text, role, character_id, user_id, partition, timestamp,
            importance_score, embedding, metadata
     FROM memories";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<MemoryRecord, MemoryError> {
    let role_str: String = row.get(3)?;
    let timestamp_str: String = row.get(7)?;
    let embedding_bytes: Vec<u8> = row.get(9)?;
    let metadata_json: String = row.get(10)?;

    Ok(MemoryRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        text: row.get(2)?,
        role: role_str.parse()?,
        character_id: row.get(4)?,
        user_id: row.get(5)?,
        partition: row.get(6)?,
        timestamp: parse_ts(&timestamp_str).ok_or_else(|| {
            MemoryError::Serialization(format!("unparseable timestamp '{timestamp_str}'"))
        })?,
        importance_score: row.get(8)?,
        embedding: bincode::deserialize(&embedding_bytes)?,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}

fn parse_ts(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter().map(|x| x / norm).collect()
    } else {
        vector.to_vec()
    }
}

/// Descending similarity; ties go to the more recent timestamp, then the id.
/// The order is total, so repeated identical queries return identical rankings.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.message.timestamp.cmp(&a.message.timestamp))
            .then_with(|| a.message.id.cmp(&b.message.id))
    });
}

/// Whether a stored partition key is visible through an owner filter.
/// Partition keys have the form `c:<character>|u:<user>`; an unspecified
/// filter component matches anything.
fn partition_matches(partition_key: &str, owner: Option<&OwnerKey>) -> bool {
    let Some(filter) = owner else { return true };
    let Some((char_part, user_part)) = partition_key.split_once('|') else {
        return false;
    };
    let stored = OwnerKey::new(
        char_part.strip_prefix("c:").filter(|s| !s.is_empty()).map(String::from),
        user_part.strip_prefix("u:").filter(|s| !s.is_empty()).map(String::from),
    );
    filter.matches(&stored)
}

/// Builds a WHERE clause for an optional owner filter with positional params.
fn owner_filter_clause(owner: Option<&OwnerKey>) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    if let Some(owner) = owner {
        if let Some(character_id) = &owner.character_id {
            params.push(character_id.clone());
            conditions.push(format!("character_id = ?{}", params.len()));
        }
        if let Some(user_id) = &owner.user_id {
            params.push(user_id.clone());
            conditions.push(format!("user_id = ?{}", params.len()));
        }
    }
    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), params)
    }
}
