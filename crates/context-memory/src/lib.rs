//! Context-memory engine: importance scoring, semantic compression, and an
//! owner-partitioned long-term memory store with hybrid retrieval, exposed
//! through a session-orchestrating manager and an optional HTTP boundary.

#[cfg(feature = "cli")]
pub mod api;
pub mod compression;
pub mod config;
pub mod context_engine;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod memory_db;
#[cfg(feature = "cli")]
pub mod metrics;
pub mod scoring;
#[cfg(feature = "cli")]
pub mod server;
pub mod telemetry;

// Public API exports
pub use compression::{CompressionBudget, CompressorConfig, SemanticCompressor};
pub use config::Config;
pub use context_engine::{CompressionReport, CompressionTarget, ContextManager};
pub use embedding::{EmbeddingCache, EmbeddingProvider, HashedEmbeddingProvider, HttpEmbeddingProvider};
pub use error::MemoryError;
pub use memory::{ContextSession, Message, MemoryStats, Metadata, MetadataValue, OwnerKey, Role};
pub use memory_db::{HybridSearchResult, MemoryDatabase, SearchHit, SearchSource};
pub use scoring::{ImportanceScorer, ScoringConfig};

#[cfg(feature = "cli")]
pub use server::run_server;
