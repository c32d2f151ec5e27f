use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::keys::CacheKeys;
use crate::common::JobId;
use crate::config::CacheConfig;

struct CacheClient {
    config: CacheConfig,
    keys: CacheKeys,
    backend: Arc<dyn CacheBackend>,
}

/// Best-effort read-through cache.
///
/// Backend failures never escape: reads degrade to a miss and writes to a
/// no-op. The active client can be swapped at runtime with [`reconfigure`].
///
/// [`reconfigure`]: CacheService::reconfigure
pub struct CacheService {
    client: RwLock<Arc<CacheClient>>,
}

impl CacheService {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            client: RwLock::new(Arc::new(CacheClient::build(config, backend))),
        }
    }

    fn current(&self) -> Arc<CacheClient> {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the active configuration and backend in one step. Callers
    /// already holding the previous client finish against it.
    pub fn reconfigure(&self, config: CacheConfig, backend: Arc<dyn CacheBackend>) {
        let next = Arc::new(CacheClient::build(config, backend));
        match self.client.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!("cache client reconfigured");
    }

    pub fn config(&self) -> CacheConfig {
        self.current().config.clone()
    }

    pub fn keys(&self) -> CacheKeys {
        self.current().keys.clone()
    }

    /// The raw substrate, shared with the reset index and auto-record queue.
    pub fn backend(&self) -> Arc<dyn CacheBackend> {
        self.current().backend.clone()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let client = self.current();
        if !client.config.enabled {
            return None;
        }

        match client.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let client = self.current();
        if !client.config.enabled {
            return;
        }

        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "cache value not serializable");
                return;
            }
        };
        if let Err(e) = client.backend.set(key, &bytes, Some(ttl)).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.current().backend.del(key).await {
            warn!(key, error = %e, "cache delete failed");
        }
    }

    pub async fn clear_pattern(&self, prefix: &str) {
        match self.current().backend.del_prefix(prefix).await {
            Ok(removed) => debug!(prefix, removed, "cache prefix cleared"),
            Err(e) => warn!(prefix, error = %e, "cache prefix clear failed"),
        }
    }

    pub async fn ping(&self) -> bool {
        match self.current().backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "cache ping failed");
                false
            }
        }
    }

    /// Drop the per-job entry and every cached pending listing.
    pub async fn invalidate_job(&self, job_id: JobId) {
        let keys = self.keys();
        self.delete(&keys.job(job_id)).await;
        self.clear_pattern(&keys.pending_jobs_prefix()).await;
    }

    pub async fn invalidate_bot_stats(&self, bot_id: &str) {
        let key = self.keys().bot_stats(bot_id);
        self.delete(&key).await;
    }
}

impl CacheClient {
    fn build(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        let keys = CacheKeys::new(config.namespace.clone());
        Self { config, keys, backend }
    }
}
