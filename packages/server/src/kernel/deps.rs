//! Server dependencies for the coordinator services (using traits for testability)
//!
//! Every store and the clock sit behind a trait object so tests can swap in
//! the in-memory implementations from `test_dependencies`.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::{AutoRecordConfig, Config, JobConfig, SchedulerConfig};
use crate::domains::auto_record::{PostgresPriceHistory, PriceHistorySink};
use crate::domains::bots::{BotRegistry, PostgresBotRegistry};
use crate::domains::crawl_jobs::store::{JobStore, PostgresJobStore};
use crate::domains::reset::{PostgresResetRuleStore, ResetRuleStore};
use crate::kernel::cache::CacheService;
use crate::kernel::{BaseClock, SystemClock};

/// Server dependencies accessible to the pull/submit services and the
/// background loops.
#[derive(Clone)]
pub struct ServerDeps {
    pub job_store: Arc<dyn JobStore>,
    pub bot_registry: Arc<dyn BotRegistry>,
    pub reset_rules: Arc<dyn ResetRuleStore>,
    pub price_history: Arc<dyn PriceHistorySink>,
    pub cache: Arc<CacheService>,
    pub clock: Arc<dyn BaseClock>,
    pub job_config: JobConfig,
    pub scheduler_config: SchedulerConfig,
    pub auto_record_config: AutoRecordConfig,
}

impl ServerDeps {
    /// Production wiring: PostgreSQL stores and the system clock.
    pub fn postgres(pool: PgPool, cache: Arc<CacheService>, config: &Config) -> Self {
        Self {
            job_store: Arc::new(PostgresJobStore::new(pool.clone())),
            bot_registry: Arc::new(PostgresBotRegistry::new(pool.clone())),
            reset_rules: Arc::new(PostgresResetRuleStore::new(pool.clone())),
            price_history: Arc::new(PostgresPriceHistory::new(pool)),
            cache,
            clock: Arc::new(SystemClock),
            job_config: config.jobs.clone(),
            scheduler_config: config.scheduler.clone(),
            auto_record_config: config.auto_record.clone(),
        }
    }
}
