use anyhow::Result;
use std::env;
use std::net::SocketAddr;
use tracing::info;

/// Engine configuration, loaded from environment variables with defaults.
/// Read-only after initialization.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the OpenAI-compatible embedding backend.
    pub embedding_backend_url: String,
    /// Model identifier sent to the backend and recorded with each vector.
    pub embedding_model: String,
    /// Fixed embedding dimensionality for this deployment. A vector of any
    /// other length is rejected, never truncated.
    pub embedding_dimension: usize,
    pub embedding_timeout_seconds: u64,

    pub db_path: String,

    pub api_host: String,
    pub api_port: u16,
    pub request_timeout_seconds: u64,

    /// Default fraction of messages kept when no explicit budget is given.
    pub compression_ratio: f32,
    /// Character budget used by adaptive compression.
    pub max_context_chars: usize,
    /// Clusters whose summed importance exceeds this keep more than one
    /// representative.
    pub high_value_threshold: f32,
    /// Upper bound on compress re-invocations when looping toward a budget.
    pub max_compression_passes: usize,

    pub max_search_results: usize,
    /// Partition size above which an HNSW index is built instead of scanning.
    pub ann_build_threshold: usize,

    /// Capacity of the bounded recent-session cache.
    pub session_cache_size: u64,
    pub store_retry_attempts: usize,
    pub store_retry_backoff_ms: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let embedding_host = env::var("EMBEDDING_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let embedding_port: u16 = env_parse("EMBEDDING_PORT", 8081);
        let embedding_backend_url = env::var("EMBEDDING_BACKEND_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", embedding_host, embedding_port));

        let cfg = Self {
            embedding_backend_url,
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "all-MiniLM-L6-v2".into()),
            embedding_dimension: env_parse("EMBEDDING_DIMENSION", 384),
            embedding_timeout_seconds: env_parse("EMBEDDING_TIMEOUT_SECONDS", 30),
            db_path: env::var("MEMORY_DB_PATH")
                .unwrap_or_else(|_| "./data/context_memory.db".into()),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env_parse("API_PORT", 8000),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 60),
            compression_ratio: env_parse("COMPRESSION_RATIO", 0.5),
            max_context_chars: env_parse("MAX_CONTEXT_CHARS", 2000),
            high_value_threshold: env_parse("HIGH_VALUE_THRESHOLD", 1.5),
            max_compression_passes: env_parse("MAX_COMPRESSION_PASSES", 8),
            max_search_results: env_parse("MAX_SEARCH_RESULTS", 10),
            ann_build_threshold: env_parse("ANN_BUILD_THRESHOLD", 256),
            session_cache_size: env_parse("SESSION_CACHE_SIZE", 128),
            store_retry_attempts: env_parse("STORE_RETRY_ATTEMPTS", 3),
            store_retry_backoff_ms: env_parse("STORE_RETRY_BACKOFF_MS", 100),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            anyhow::bail!("EMBEDDING_DIMENSION must be positive");
        }
        if !(self.compression_ratio > 0.0 && self.compression_ratio <= 1.0) {
            anyhow::bail!("COMPRESSION_RATIO must be in (0, 1]");
        }
        if self.high_value_threshold < 0.0 {
            anyhow::bail!("HIGH_VALUE_THRESHOLD must be non-negative");
        }
        if self.max_compression_passes == 0 {
            anyhow::bail!("MAX_COMPRESSION_PASSES must be at least 1");
        }
        if self.max_search_results == 0 {
            anyhow::bail!("MAX_SEARCH_RESULTS must be at least 1");
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Embedding Backend: {}", self.embedding_backend_url);
        info!("- Embedding Model: {} ({} dims)", self.embedding_model, self.embedding_dimension);
        info!("- Database: {}", self.db_path);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Compression Ratio: {}", self.compression_ratio);
        info!("- Max Context Chars: {}", self.max_context_chars);
        info!("- ANN Build Threshold: {}", self.ann_build_threshold);
        info!("- Session Cache Size: {}", self.session_cache_size);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.api_host, self.api_port).parse()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_backend_url: "http://127.0.0.1:8081".into(),
            embedding_model: "all-MiniLM-L6-v2".into(),
            embedding_dimension: 384,
            embedding_timeout_seconds: 30,
            db_path: "./data/context_memory.db".into(),
            api_host: "127.0.0.1".into(),
            api_port: 8000,
            request_timeout_seconds: 60,
            compression_ratio: 0.5,
            max_context_chars: 2000,
            high_value_threshold: 1.5,
            max_compression_passes: 8,
            max_search_results: 10,
            ann_build_threshold: 256,
            session_cache_size: 128,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 100,
        }
    }
}
