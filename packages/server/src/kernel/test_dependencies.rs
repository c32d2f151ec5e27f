// TestDependencies - in-memory implementations for testing
//
// Provides stores, a controllable clock and misbehaving backends that can be
// injected into ServerDeps for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::cache::{CacheBackend, CacheError, CacheService, LocalBackend};
use super::{BaseClock, ServerDeps};
use crate::config::{AutoRecordConfig, CacheConfig, JobConfig, SchedulerConfig};
use crate::domains::auto_record::{
    InMemoryPriceHistory, PriceHistoryEntry, PriceHistorySink, PriceObservation, WriteOutcome,
};
use crate::domains::bots::InMemoryBotRegistry;
use crate::domains::crawl_jobs::store::InMemoryJobStore;
use crate::domains::reset::InMemoryResetRuleStore;

// =============================================================================
// Manual Clock
// =============================================================================

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// A fixed, round starting instant so assertions can use literal times.
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl BaseClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// =============================================================================
// Failing Cache Backend
// =============================================================================

/// Backend where every call fails, as if the server were down.
pub struct FailingCacheBackend;

fn down<T>() -> Result<T, CacheError> {
    Err(CacheError::Backend("connection refused".into()))
}

#[async_trait]
impl CacheBackend for FailingCacheBackend {
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, CacheError> {
        down()
    }
    async fn set(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), CacheError> {
        down()
    }
    async fn del(&self, _: &str) -> Result<(), CacheError> {
        down()
    }
    async fn del_prefix(&self, _: &str) -> Result<u64, CacheError> {
        down()
    }
    async fn set_nx(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<bool, CacheError> {
        down()
    }
    async fn incr(&self, _: &str, _: i64, _: Option<Duration>) -> Result<i64, CacheError> {
        down()
    }
    async fn ping(&self) -> Result<(), CacheError> {
        down()
    }
    async fn zadd(&self, _: &str, _: f64, _: &str) -> Result<bool, CacheError> {
        down()
    }
    async fn zrange_by_score(&self, _: &str, _: f64, _: usize) -> Result<Vec<String>, CacheError> {
        down()
    }
    async fn zscore(&self, _: &str, _: &str) -> Result<Option<f64>, CacheError> {
        down()
    }
    async fn zrem(&self, _: &str, _: &str) -> Result<bool, CacheError> {
        down()
    }
    async fn zcard(&self, _: &str) -> Result<u64, CacheError> {
        down()
    }
    async fn rpush(&self, _: &str, _: &str) -> Result<u64, CacheError> {
        down()
    }
    async fn lpop(&self, _: &str, _: usize) -> Result<Vec<String>, CacheError> {
        down()
    }
    async fn llen(&self, _: &str) -> Result<u64, CacheError> {
        down()
    }
    async fn sadd(&self, _: &str, _: &str) -> Result<bool, CacheError> {
        down()
    }
    async fn srem(&self, _: &str, _: &str) -> Result<bool, CacheError> {
        down()
    }
    async fn spop(&self, _: &str, _: usize) -> Result<Vec<String>, CacheError> {
        down()
    }
    async fn scard(&self, _: &str) -> Result<u64, CacheError> {
        down()
    }
}

// =============================================================================
// Flaky Price History
// =============================================================================

/// In-memory sink that fails a configurable number of writes first.
#[derive(Default)]
pub struct FlakyPriceHistory {
    inner: InMemoryPriceHistory,
    failures_left: AtomicUsize,
    writes_attempted: AtomicUsize,
}

impl FlakyPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let sink = Self::default();
        sink.fail_next(times);
        sink
    }

    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn writes_attempted(&self) -> usize {
        self.writes_attempted.load(Ordering::SeqCst)
    }

    pub fn entries_for(&self, target_ref: &str) -> Vec<PriceHistoryEntry> {
        self.inner.entries_for(target_ref)
    }
}

#[async_trait]
impl PriceHistorySink for FlakyPriceHistory {
    async fn write_if_changed(&self, obs: &PriceObservation) -> Result<WriteOutcome> {
        self.writes_attempted.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("price history unavailable"));
        }
        self.inner.write_if_changed(obs).await
    }

    async fn latest(&self, target_ref: &str) -> Result<Option<PriceHistoryEntry>> {
        self.inner.latest(target_ref).await
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

#[derive(Clone)]
pub struct TestDependencies {
    pub job_store: Arc<InMemoryJobStore>,
    pub bot_registry: Arc<InMemoryBotRegistry>,
    pub reset_rules: Arc<InMemoryResetRuleStore>,
    pub price_history: Arc<FlakyPriceHistory>,
    pub backend: Arc<dyn CacheBackend>,
    pub clock: Arc<ManualClock>,
    pub job_config: JobConfig,
    pub cache_config: CacheConfig,
    pub scheduler_config: SchedulerConfig,
    pub auto_record_config: AutoRecordConfig,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            job_store: Arc::new(InMemoryJobStore::new()),
            bot_registry: Arc::new(InMemoryBotRegistry::new()),
            reset_rules: Arc::new(InMemoryResetRuleStore::new()),
            price_history: Arc::new(FlakyPriceHistory::new()),
            backend: Arc::new(LocalBackend::new()),
            clock: Arc::new(ManualClock::at_epoch()),
            job_config: JobConfig::default(),
            cache_config: CacheConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            auto_record_config: AutoRecordConfig::default(),
        }
    }

    /// Set the cache/queue backend
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn price_history(mut self, sink: FlakyPriceHistory) -> Self {
        self.price_history = Arc::new(sink);
        self
    }

    pub fn job_config(mut self, config: JobConfig) -> Self {
        self.job_config = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn auto_record_config(mut self, config: AutoRecordConfig) -> Self {
        self.auto_record_config = config;
        self
    }

    /// Wire everything into ServerDeps. The builder keeps its handles, so
    /// tests can inspect the same stores the services write to.
    pub fn server_deps(&self) -> ServerDeps {
        ServerDeps {
            job_store: self.job_store.clone(),
            bot_registry: self.bot_registry.clone(),
            reset_rules: self.reset_rules.clone(),
            price_history: self.price_history.clone(),
            cache: Arc::new(CacheService::new(
                self.cache_config.clone(),
                self.backend.clone(),
            )),
            clock: self.clock.clone(),
            job_config: self.job_config.clone(),
            scheduler_config: self.scheduler_config.clone(),
            auto_record_config: self.auto_record_config.clone(),
        }
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
