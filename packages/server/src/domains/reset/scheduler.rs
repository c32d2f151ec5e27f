//! Deferred reset scheduler.
//!
//! DONE jobs are returned to PENDING through a time-ordered index kept in the
//! cache backend (score = reset instant in unix millis, member = job id).
//! Entries are registered after each successful submission and in bulk by
//! rule passes; the due step drains them. The index is advisory: losing it
//! only delays resets, and draining the same entry twice is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::models::{ResetRule, RuleSet};
use crate::common::JobId;
use crate::domains::crawl_jobs::models::{CrawlJob, JobSelection};
use crate::kernel::ServerDeps;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RulePassReport {
    pub rules_fired: usize,
    pub jobs_registered: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DueReport {
    /// Entries that flipped a DONE job to PENDING.
    pub reset: usize,
    /// Entries whose job was no longer DONE (or no longer exists).
    pub skipped: usize,
    /// Entries left in the index after a store error.
    pub failed: usize,
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

pub struct DeferredResetScheduler {
    deps: Arc<ServerDeps>,
    started: AtomicBool,
}

impl DeferredResetScheduler {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self {
            deps,
            started: AtomicBool::new(false),
        }
    }

    /// Claim the background loop slot. Returns false if a loop already runs.
    pub fn try_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    async fn rule_set(&self) -> Result<RuleSet> {
        Ok(RuleSet::new(self.deps.reset_rules.enabled_rules().await?))
    }

    /// When a just-completed job should return to PENDING.
    pub async fn next_reset_at(&self, job: &CrawlJob, now: DateTime<Utc>) -> DateTime<Utc> {
        let frequency = match self.rule_set().await {
            Ok(rules) => rules.winner(job).map(|rule| rule.frequency()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "reset rules unavailable, using default frequency");
                None
            }
        };
        now + frequency.unwrap_or(self.deps.scheduler_config.default_frequency)
    }

    pub async fn register(&self, job_id: JobId, run_at: DateTime<Utc>) -> Result<()> {
        let key = self.deps.cache.keys().reset_index();
        self.deps
            .cache
            .backend()
            .zadd(&key, score(run_at), &job_id.to_string())
            .await?;
        Ok(())
    }

    /// Compute and register the next reset of a job that just completed.
    /// Index failures are logged; the computed instant is returned either way.
    pub async fn schedule_after_success(&self, job: &CrawlJob) -> DateTime<Utc> {
        let now = self.deps.clock.now();
        let run_at = self.next_reset_at(job, now).await;
        match self.register(job.id, run_at).await {
            Ok(()) => debug!(job_id = %job.id, %run_at, "reset scheduled"),
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to register deferred reset"),
        }
        run_at
    }

    /// Evaluate each due rule against DONE jobs and register the jobs it
    /// wins for immediate reset, up to `rule_batch_size` per rule.
    pub async fn run_rule_pass(&self) -> Result<RulePassReport> {
        let now = self.deps.clock.now();
        let rules = self.rule_set().await?;
        let batch = self.deps.scheduler_config.rule_batch_size.max(1);
        let mut report = RulePassReport::default();

        for (rule, selection) in rules.iter() {
            if !rule.is_due(now) {
                continue;
            }

            let registered = self.register_rule_matches(&rules, rule, selection, batch, now).await?;

            self.deps.reset_rules.mark_rule_run(rule.id, now).await?;
            info!(rule_id = %rule.id, rule = %rule.name, registered, "reset rule fired");
            report.rules_fired += 1;
            report.jobs_registered += registered;
        }

        Ok(report)
    }

    /// Page through DONE jobs matching `selection`, registering those `rule`
    /// wins, until `batch` are registered or the matches run out. Jobs won by
    /// a higher-precedence rule are passed over without counting.
    async fn register_rule_matches(
        &self,
        rules: &RuleSet,
        rule: &ResetRule,
        selection: &JobSelection,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut registered = 0;
        let mut cursor = None;

        loop {
            let page = self
                .deps
                .job_store
                .done_jobs(selection, cursor, batch as i64)
                .await?;

            for job in &page {
                if rules.winner(job).map(|w| w.id) != Some(rule.id) {
                    continue;
                }
                self.register(job.id, now).await?;
                registered += 1;
                if registered == batch {
                    return Ok(registered);
                }
            }

            if page.len() < batch {
                return Ok(registered);
            }
            cursor = page.last().map(|job| (job.updated_at, job.id));
        }
    }

    /// Reset up to `limit` jobs whose reset instant has passed.
    ///
    /// Store errors leave the entry in place to be retried on a later pass;
    /// success and no-op both remove it.
    pub async fn process_due(&self, limit: usize) -> Result<DueReport> {
        let now = self.deps.clock.now();
        let key = self.deps.cache.keys().reset_index();
        let backend = self.deps.cache.backend();
        let due = backend.zrange_by_score(&key, score(now), limit).await?;
        let mut report = DueReport::default();

        for member in due {
            let Ok(job_id) = member.parse::<JobId>() else {
                warn!(member = %member, "dropping malformed reset index entry");
                backend.zrem(&key, &member).await?;
                continue;
            };

            match self.deps.job_store.reset_to_pending(job_id, now).await {
                Ok(true) => {
                    report.reset += 1;
                    self.deps.cache.delete(&self.deps.cache.keys().job(job_id)).await;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "deferred reset failed, will retry");
                    report.failed += 1;
                    continue;
                }
            }

            // A newer registration for the same job keeps its later score.
            let still_due = backend
                .zscore(&key, &member)
                .await?
                .map_or(false, |s| s <= score(now));
            if still_due {
                backend.zrem(&key, &member).await?;
            }
        }

        if report.reset > 0 {
            self.deps
                .cache
                .clear_pattern(&self.deps.cache.keys().pending_jobs_prefix())
                .await;
            debug!(reset = report.reset, skipped = report.skipped, "processed due resets");
        }

        Ok(report)
    }

    /// Number of registered resets, due or not.
    pub async fn pending_count(&self) -> Result<u64> {
        let key = self.deps.cache.keys().reset_index();
        Ok(self.deps.cache.backend().zcard(&key).await?)
    }
}
