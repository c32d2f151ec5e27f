use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache pool error: {0}")]
    Pool(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<deadpool_redis::redis::RedisError> for CacheError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::Pool(e.to_string())
    }
}

/// Key-value substrate shared by the cache layer, the deferred reset index and
/// the auto-record queue.
///
/// Nothing stored here is authoritative; every caller must tolerate the
/// backend being flushed or unavailable.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    /// Delete every plain key starting with `prefix`; returns how many were removed.
    async fn del_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
    /// Set only if absent (or expired). Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, CacheError>;
    /// Increment a counter; `ttl` is applied when the counter is created.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;

    // Sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, CacheError>;
    /// Members with `score <= max`, lowest score first, at most `limit`.
    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, CacheError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError>;
    async fn zcard(&self, key: &str) -> Result<u64, CacheError>;

    // Lists (FIFO)
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CacheError>;
    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError>;
    async fn llen(&self, key: &str) -> Result<u64, CacheError>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, CacheError>;
    async fn spop(&self, key: &str, count: usize) -> Result<Vec<String>, CacheError>;
    async fn scard(&self, key: &str) -> Result<u64, CacheError>;
}
