//! Pull: authenticate a bot and lease it up to `max_jobs` jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{CoordinatorError, JobId};
use crate::domains::bots::{authenticate, BotIdentity};
use crate::domains::crawl_jobs::models::CrawlJob;
use crate::domains::reset::DeferredResetScheduler;
use crate::kernel::ServerDeps;

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub bot_id: String,
    pub credential: String,
    #[serde(default)]
    pub max_jobs: Option<i64>,
    /// Target group to pull from.
    #[serde(default)]
    pub target_filter: Option<String>,
}

/// What a bot needs to run a job and abort before its lease lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job_id: JobId,
    pub target_ref: String,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_seconds: i64,
    pub retry_count: i32,
    pub lease_expires_at: DateTime<Utc>,
}

impl LeasedJob {
    fn from_job(job: &CrawlJob) -> Option<Self> {
        Some(Self {
            job_id: job.id,
            target_ref: job.target_ref.clone(),
            priority: job.priority,
            max_retries: job.max_retries,
            timeout_seconds: job.lock_ttl_seconds,
            retry_count: job.retry_count,
            lease_expires_at: job.lease_expires_at()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub jobs: Vec<LeasedJob>,
    pub count: usize,
    /// Candidates lost to other bots during this pull.
    pub skipped: usize,
}

/// Cached candidate listing; `limit` is how many were asked of the store.
#[derive(Debug, Serialize, Deserialize)]
struct CachedPendingList {
    limit: i64,
    jobs: Vec<CrawlJob>,
}

pub struct PullService {
    deps: Arc<ServerDeps>,
    scheduler: Arc<DeferredResetScheduler>,
}

/// A bot restricted to one group may only ask for that group.
fn resolve_target_group(
    bot: &BotIdentity,
    requested: Option<String>,
) -> Result<Option<String>, CoordinatorError> {
    let requested = requested
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match (&bot.allowed_target_filter, requested) {
        (Some(allowed), Some(asked)) if !allowed.eq_ignore_ascii_case(&asked) => {
            Err(CoordinatorError::validation(format!(
                "bot {} may only pull from target group {}",
                bot.bot_id, allowed
            )))
        }
        (Some(allowed), _) => Ok(Some(allowed.clone())),
        (None, asked) => Ok(asked),
    }
}

/// Candidates to read for `max_jobs` leases, saturating for huge bot limits.
fn candidate_fetch(max_jobs: i64, multiplier: usize) -> i64 {
    let multiplier = i64::try_from(multiplier.max(1)).unwrap_or(i64::MAX);
    max_jobs.saturating_mul(multiplier)
}

fn clamp_max_jobs(bot: &BotIdentity, requested: Option<i64>) -> Result<i64, CoordinatorError> {
    match requested {
        Some(n) if n < 1 => Err(CoordinatorError::validation("max_jobs must be at least 1")),
        Some(n) => Ok(n.min(bot.max_jobs_per_pull)),
        None => Ok(bot.max_jobs_per_pull),
    }
}

impl PullService {
    pub fn new(deps: Arc<ServerDeps>, scheduler: Arc<DeferredResetScheduler>) -> Self {
        Self { deps, scheduler }
    }

    pub async fn pull(&self, request: PullRequest) -> Result<PullResponse, CoordinatorError> {
        let bot = authenticate(
            self.deps.bot_registry.as_ref(),
            &request.bot_id,
            &request.credential,
        )
        .await?;

        let max_jobs = clamp_max_jobs(&bot, request.max_jobs)?;
        let target_group = resolve_target_group(&bot, request.target_filter)?;
        self.check_rate_limit(&bot).await?;

        // Freshly due resets become visible to this pull.
        if let Err(e) = self
            .scheduler
            .process_due(self.deps.scheduler_config.pull_due_batch_size)
            .await
        {
            warn!(error = %e, "due reset processing during pull failed");
        }

        let now = self.deps.clock.now();
        let mut leased = Vec::new();
        let mut skipped = 0;

        if max_jobs > 0 {
            let fetch = candidate_fetch(max_jobs, self.deps.job_config.candidate_multiplier);
            let candidates = self.candidates(target_group.as_deref(), fetch, now).await?;

            for candidate in candidates {
                if leased.len() as i64 >= max_jobs {
                    break;
                }

                match self
                    .deps
                    .job_store
                    .acquire_lease(candidate.id, &bot.bot_id, bot.custom_lock_ttl_seconds, now)
                    .await
                {
                    Ok(Some(job)) => {
                        if let Some(previous) = &job.expired_owner {
                            info!(job_id = %job.id, bot_id = %bot.bot_id, previous_owner = %previous, "reclaimed stale lease");
                        }
                        self.deps.cache.invalidate_job(job.id).await;
                        leased.push(job);
                    }
                    Ok(None) => skipped += 1,
                    Err(e) => {
                        warn!(job_id = %candidate.id, error = %e, "lease acquisition failed");
                        skipped += 1;
                    }
                }
            }
        }

        if let Err(e) = self
            .deps
            .bot_registry
            .record_pull(&bot.bot_id, leased.len() as i64, now)
            .await
        {
            warn!(bot_id = %bot.bot_id, error = %e, "failed to record pull stats");
        }
        self.deps.cache.invalidate_bot_stats(&bot.bot_id).await;

        if skipped > 0 {
            debug!(bot_id = %bot.bot_id, skipped, "lost lease races during pull");
        }
        info!(bot_id = %bot.bot_id, leased = leased.len(), requested = max_jobs, "pull served");

        let jobs: Vec<LeasedJob> = leased.iter().filter_map(LeasedJob::from_job).collect();
        Ok(PullResponse {
            count: jobs.len(),
            jobs,
            skipped,
        })
    }

    /// Lease candidates through the pending-list cache.
    async fn candidates(
        &self,
        target_group: Option<&str>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CrawlJob>, CoordinatorError> {
        let group_key = target_group.map(str::to_lowercase);
        let key = self.deps.cache.keys().pending_jobs(group_key.as_deref());

        if let Some(cached) = self.deps.cache.get_json::<CachedPendingList>(&key).await {
            if cached.limit >= limit {
                debug!(key = %key, "pending list cache hit");
                return Ok(cached.jobs.into_iter().take(limit as usize).collect());
            }
        }

        let jobs = self
            .deps
            .job_store
            .lease_candidates(target_group, now, limit)
            .await?;

        let ttl = self.deps.cache.config().pending_jobs_ttl;
        let listing = CachedPendingList {
            limit,
            jobs: jobs.clone(),
        };
        self.deps.cache.set_json(&key, &listing, ttl).await;

        Ok(jobs)
    }

    /// Per-minute counter in the backend. Backend failures let the pull through.
    async fn check_rate_limit(&self, bot: &BotIdentity) -> Result<(), CoordinatorError> {
        let Some(limit) = bot.rate_limit_per_minute.filter(|l| *l > 0) else {
            return Ok(());
        };

        let minute = self.deps.clock.now().timestamp().div_euclid(60);
        let key = self.deps.cache.keys().bot_rate(&bot.bot_id, minute);
        match self
            .deps
            .cache
            .backend()
            .incr(&key, 1, Some(Duration::from_secs(120)))
            .await
        {
            Ok(count) if count > limit => {
                warn!(bot_id = %bot.bot_id, count, limit, "pull rate limit exceeded");
                Err(CoordinatorError::RateLimited { limit })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(bot_id = %bot.bot_id, error = %e, "rate limit counter unavailable, allowing pull");
                Ok(())
            }
        }
    }
}
