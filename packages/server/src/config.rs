use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::auto_record::EligibilityPolicy;
use crate::domains::crawl_jobs::models::SourceKind;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Absent means the in-process backend (not durable across restarts).
    pub redis_url: Option<String>,
    pub port: u16,
    pub jobs: JobConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub auto_record: AutoRecordConfig,
}

/// Lease and candidate-selection settings for the pull/submit services.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub default_lock_ttl_seconds: i64,
    /// How many candidates to read per requested job, to absorb lost races.
    pub candidate_multiplier: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl_seconds: 300,
            candidate_multiplier: 3,
        }
    }
}

/// Reloadable cache settings, see `CacheService::reconfigure`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub namespace: String,
    pub pending_jobs_ttl: Duration,
    pub job_ttl: Duration,
    pub bot_stats_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "crawl".to_string(),
            pending_jobs_ttl: Duration::from_secs(30),
            job_ttl: Duration::from_secs(300),
            bot_stats_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Used when no reset rule matches a completed job.
    pub default_frequency: chrono::Duration,
    pub loop_interval: Duration,
    /// Cap on jobs registered per rule pass.
    pub rule_batch_size: usize,
    /// Cap on due entries processed per background tick.
    pub due_batch_size: usize,
    /// Cap on due entries processed opportunistically inside a pull.
    pub pull_due_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_frequency: chrono::Duration::hours(24),
            loop_interval: Duration::from_secs(60),
            rule_batch_size: 500,
            due_batch_size: 500,
            pull_due_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoRecordConfig {
    pub policy: EligibilityPolicy,
    pub batch_size: usize,
    /// Failures tolerated before a result moves to the permanent-failure set.
    pub max_retries: i64,
    pub poll_interval: Duration,
    /// Permanently failed ids moved back to the queue per sweep.
    pub retry_failed_batch: usize,
    /// Stranded results re-enqueued per sweep, per status.
    pub stranded_batch: usize,
    /// How long a result may sit `queued` before the sweep pushes it again.
    pub queued_grace: chrono::Duration,
    /// How often the worker runs the stranded and retry-failed sweeps.
    pub sweep_interval: Duration,
    pub processing_guard_ttl: Duration,
}

impl Default for AutoRecordConfig {
    fn default() -> Self {
        Self {
            policy: EligibilityPolicy::default(),
            batch_size: 50,
            max_retries: 3,
            poll_interval: Duration::from_secs(5),
            retry_failed_batch: 20,
            stranded_batch: 100,
            queued_grace: chrono::Duration::minutes(10),
            sweep_interval: Duration::from_secs(60),
            processing_guard_ttl: Duration::from_secs(120),
        }
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let jobs = JobConfig {
            default_lock_ttl_seconds: var_or("DEFAULT_LOCK_TTL_SECONDS", 300)?,
            candidate_multiplier: var_or("CANDIDATE_MULTIPLIER", 3)?,
        };

        let cache = CacheConfig {
            enabled: var_or("CACHE_ENABLED", true)?,
            namespace: env::var("CACHE_NAMESPACE").unwrap_or_else(|_| "crawl".to_string()),
            pending_jobs_ttl: Duration::from_secs(var_or("PENDING_CACHE_TTL_SECONDS", 30)?),
            job_ttl: Duration::from_secs(var_or("JOB_CACHE_TTL_SECONDS", 300)?),
            bot_stats_ttl: Duration::from_secs(var_or("BOT_STATS_CACHE_TTL_SECONDS", 60)?),
        };

        let reset_batch: usize = var_or("RESET_BATCH_SIZE", 500)?;
        let scheduler = SchedulerConfig {
            default_frequency: chrono::Duration::seconds(var_or(
                "DEFAULT_RESET_FREQUENCY_SECONDS",
                86_400,
            )?),
            loop_interval: Duration::from_secs(var_or("RESET_LOOP_INTERVAL_SECONDS", 60)?),
            rule_batch_size: reset_batch,
            due_batch_size: reset_batch,
            pull_due_batch_size: var_or("PULL_DUE_BATCH_SIZE", 50)?,
        };

        let allowed_sources = list_var("AUTO_RECORD_ALLOWED_SOURCES")
            .iter()
            .map(|s| s.parse::<SourceKind>())
            .collect::<Result<Vec<_>, _>>()
            .context("AUTO_RECORD_ALLOWED_SOURCES contains an unknown source")?;

        let policy = EligibilityPolicy {
            enabled: var_or("AUTO_RECORD_ENABLED", true)?,
            require_in_stock: var_or("AUTO_RECORD_REQUIRE_IN_STOCK", true)?,
            allowed_domains: list_var("AUTO_RECORD_ALLOWED_DOMAINS"),
            allowed_currencies: list_var("AUTO_RECORD_ALLOWED_CURRENCIES")
                .into_iter()
                .map(|c| c.to_uppercase())
                .collect(),
            allowed_sources,
            min_ml_confidence: var_or("AUTO_RECORD_MIN_ML_CONFIDENCE", 0.8)?,
        };

        let defaults = AutoRecordConfig::default();
        let auto_record = AutoRecordConfig {
            policy,
            batch_size: var_or("AUTO_RECORD_BATCH_SIZE", defaults.batch_size)?,
            max_retries: var_or("AUTO_RECORD_MAX_RETRIES", defaults.max_retries)?,
            poll_interval: Duration::from_secs(var_or("AUTO_RECORD_POLL_INTERVAL_SECONDS", 5)?),
            retry_failed_batch: var_or("AUTO_RECORD_RETRY_FAILED_BATCH", defaults.retry_failed_batch)?,
            stranded_batch: var_or("AUTO_RECORD_STRANDED_BATCH", defaults.stranded_batch)?,
            queued_grace: chrono::Duration::seconds(var_or("AUTO_RECORD_QUEUED_GRACE_SECONDS", 600)?),
            sweep_interval: Duration::from_secs(var_or("AUTO_RECORD_SWEEP_INTERVAL_SECONDS", 60)?),
            processing_guard_ttl: defaults.processing_guard_ttl,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            port: var_or("PORT", 8080)?,
            jobs,
            cache,
            scheduler,
            auto_record,
        })
    }
}
