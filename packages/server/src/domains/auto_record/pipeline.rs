//! Auto-record pipeline.
//!
//! Eligible results are queued by id on a FIFO list in the cache backend and
//! drained in batches by [`AutoRecordWorker`](super::AutoRecordWorker).
//! Delivery is at-least-once: a per-result processing guard and the sink's
//! duplicate detection make repeated delivery harmless.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::policy::Eligibility;
use super::sink::{PriceObservation, WriteOutcome};
use crate::common::ResultId;
use crate::domains::crawl_jobs::models::{AutoRecordStatus, CrawlResult};
use crate::kernel::ServerDeps;

/// TTL of the per-result failure counter; long enough to span every retry.
const FAILURE_COUNTER_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Recorded,
    Duplicate,
    /// Already recorded, being processed elsewhere, or gone.
    Skipped,
    /// Transient failure, re-enqueued at the tail.
    Retrying,
    /// Retries exhausted, moved to the permanent-failure set.
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl BatchReport {
    fn add(&mut self, outcome: ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Recorded => self.recorded += 1,
            ProcessOutcome::Duplicate => self.duplicates += 1,
            ProcessOutcome::Skipped => self.skipped += 1,
            ProcessOutcome::Retrying => self.retrying += 1,
            ProcessOutcome::Failed => self.failed += 1,
        }
    }
}

fn observation(result: &CrawlResult) -> PriceObservation {
    let source = result
        .structured_payload
        .sources
        .first()
        .map(|s| format!("crawl:{}", s.kind()))
        .unwrap_or_else(|| "crawl".to_string());

    PriceObservation {
        target_ref: result.target_ref.clone(),
        price: result.price,
        currency: result.currency.to_uppercase(),
        available: result.in_stock,
        observed_at: result.observed_at,
        source,
    }
}

pub struct AutoRecordPipeline {
    deps: Arc<ServerDeps>,
}

impl AutoRecordPipeline {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    async fn set_status(&self, id: ResultId, status: AutoRecordStatus, reason: Option<&str>) {
        let now = self.deps.clock.now();
        if let Err(e) = self
            .deps
            .job_store
            .set_auto_record_status(id, status, reason, now)
            .await
        {
            warn!(result_id = %id, status = ?status, error = %e, "failed to update auto-record status");
        }
    }

    async fn push(&self, id: ResultId) -> Result<()> {
        let key = self.deps.cache.keys().auto_record_queue();
        self.deps.cache.backend().rpush(&key, &id.to_string()).await?;
        Ok(())
    }

    /// Evaluate eligibility, record the verdict and queue eligible results.
    ///
    /// Queue failures leave the result `eligible`; the stranded sweep picks
    /// it up later.
    pub async fn enqueue(&self, result: &CrawlResult) -> Eligibility {
        let verdict = self.deps.auto_record_config.policy.evaluate(result);

        match &verdict {
            Eligibility::Ineligible(reason) => {
                debug!(result_id = %result.id, reason = %reason, "result not eligible for auto-record");
                self.set_status(result.id, AutoRecordStatus::Ineligible, Some(reason))
                    .await;
            }
            Eligibility::Eligible => {
                self.set_status(result.id, AutoRecordStatus::Eligible, None).await;
                match self.push(result.id).await {
                    Ok(()) => {
                        self.set_status(result.id, AutoRecordStatus::Queued, None).await;
                    }
                    Err(e) => {
                        warn!(result_id = %result.id, error = %e, "auto-record queue unavailable, left for sweep");
                    }
                }
            }
        }

        verdict
    }

    /// Pop and process up to `batch_size` queued ids.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let key = self.deps.cache.keys().auto_record_queue();
        let batch = self.deps.auto_record_config.batch_size;
        let ids = self.deps.cache.backend().lpop(&key, batch).await?;

        let mut report = BatchReport::default();
        for raw in ids {
            let Ok(id) = raw.parse::<ResultId>() else {
                warn!(entry = %raw, "dropping malformed auto-record queue entry");
                continue;
            };
            report.add(self.process_one(id).await);
        }

        if report.processed > 0 {
            debug!(
                processed = report.processed,
                recorded = report.recorded,
                duplicates = report.duplicates,
                retrying = report.retrying,
                failed = report.failed,
                "auto-record batch processed"
            );
        }
        Ok(report)
    }

    /// Process one delivery of `id`.
    pub async fn process_one(&self, id: ResultId) -> ProcessOutcome {
        let keys = self.deps.cache.keys();
        let backend = self.deps.cache.backend();
        let guard = keys.auto_record_processing(id);
        let ttl = self.deps.auto_record_config.processing_guard_ttl;

        match backend.set_nx(&guard, b"1", Some(ttl)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(result_id = %id, "already processing elsewhere");
                return ProcessOutcome::Skipped;
            }
            Err(e) => {
                // No guard available; the sink's duplicate check still holds.
                warn!(result_id = %id, error = %e, "processing guard unavailable");
            }
        }

        let outcome = match self.record(id).await {
            Ok(outcome) => {
                if let Err(e) = backend.del(&keys.auto_record_failures(id)).await {
                    debug!(result_id = %id, error = %e, "failed to clear failure counter");
                }
                outcome
            }
            Err(e) => self.handle_failure(id, &e).await,
        };

        if let Err(e) = backend.del(&guard).await {
            debug!(result_id = %id, error = %e, "failed to release processing guard");
        }
        outcome
    }

    async fn record(&self, id: ResultId) -> Result<ProcessOutcome> {
        let Some(result) = self.deps.job_store.find_result(id).await? else {
            debug!(result_id = %id, "queued result not found");
            return Ok(ProcessOutcome::Skipped);
        };
        let now = self.deps.clock.now();
        if result.recorded {
            if result.auto_record_status != AutoRecordStatus::Completed {
                self.deps.job_store.mark_recorded(id, "recorded", now).await?;
            }
            return Ok(ProcessOutcome::Skipped);
        }
        if !result.succeeded || result.auto_record_status == AutoRecordStatus::Completed {
            return Ok(ProcessOutcome::Skipped);
        }

        self.deps
            .job_store
            .set_auto_record_status(id, AutoRecordStatus::Processing, None, now)
            .await?;

        match self.deps.price_history.write_if_changed(&observation(&result)).await? {
            WriteOutcome::Written(entry_id) => {
                self.deps.job_store.mark_recorded(id, "recorded", now).await?;
                info!(result_id = %id, entry_id = %entry_id, target = %result.target_ref, "price recorded");
                Ok(ProcessOutcome::Recorded)
            }
            WriteOutcome::Duplicate => {
                self.deps
                    .job_store
                    .set_auto_record_status(id, AutoRecordStatus::Completed, Some("duplicate"), now)
                    .await?;
                debug!(result_id = %id, "price unchanged, not recorded");
                Ok(ProcessOutcome::Duplicate)
            }
        }
    }

    async fn handle_failure(&self, id: ResultId, err: &anyhow::Error) -> ProcessOutcome {
        let keys = self.deps.cache.keys();
        let backend = self.deps.cache.backend();
        let max_retries = self.deps.auto_record_config.max_retries;

        let failures = match backend
            .incr(&keys.auto_record_failures(id), 1, Some(FAILURE_COUNTER_TTL))
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(result_id = %id, error = %e, "failure counter unavailable");
                max_retries
            }
        };

        if failures < max_retries {
            warn!(result_id = %id, attempt = failures, error = %err, "auto-record failed, retrying");
            let reason = format!("attempt {} failed: {}", failures, err);
            match self.push(id).await {
                Ok(()) => self.set_status(id, AutoRecordStatus::Queued, Some(&reason)).await,
                Err(e) => {
                    warn!(result_id = %id, error = %e, "could not re-enqueue, left for sweep");
                    self.set_status(id, AutoRecordStatus::Eligible, Some(&reason)).await;
                }
            }
            return ProcessOutcome::Retrying;
        }

        warn!(result_id = %id, attempts = failures, error = %err, "auto-record retries exhausted");
        if let Err(e) = backend.sadd(&keys.auto_record_failed(), &id.to_string()).await {
            warn!(result_id = %id, error = %e, "failed to add to permanent-failure set");
        }
        if let Err(e) = backend.del(&keys.auto_record_failures(id)).await {
            debug!(result_id = %id, error = %e, "failed to clear failure counter");
        }
        let reason = format!("failed after {} attempts: {}", failures, err);
        self.set_status(id, AutoRecordStatus::Failed, Some(&reason)).await;
        ProcessOutcome::Failed
    }

    /// Move up to `limit` permanently failed ids back into the queue.
    pub async fn retry_failed(&self, limit: usize) -> Result<usize> {
        let keys = self.deps.cache.keys();
        let backend = self.deps.cache.backend();
        let ids = backend.spop(&keys.auto_record_failed(), limit).await?;

        let mut requeued = 0;
        for raw in ids {
            let Ok(id) = raw.parse::<ResultId>() else {
                continue;
            };
            backend.rpush(&keys.auto_record_queue(), &raw).await?;
            self.set_status(id, AutoRecordStatus::Queued, Some("retrying after failure"))
                .await;
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued, "permanently failed results re-enqueued");
        }
        Ok(requeued)
    }

    /// Re-enqueue results that were judged eligible but never reached the
    /// queue, whose processing was interrupted, or that have sat `queued`
    /// past the grace period (their queue entry may be gone with a flushed
    /// or restarted backend).
    pub async fn requeue_stranded(&self, limit: usize) -> Result<usize> {
        let keys = self.deps.cache.keys();
        let backend = self.deps.cache.backend();
        let now = self.deps.clock.now();
        let queued_before = now - self.deps.auto_record_config.queued_grace;
        let mut requeued = 0;
        for (status, changed_before) in [
            (AutoRecordStatus::Eligible, now),
            (AutoRecordStatus::Processing, now),
            (AutoRecordStatus::Queued, queued_before),
        ] {
            let ids = self
                .deps
                .job_store
                .results_with_status(status, changed_before, limit as i64)
                .await?;
            for id in ids {
                if status == AutoRecordStatus::Processing
                    && backend.get(&keys.auto_record_processing(id)).await?.is_some()
                {
                    continue;
                }
                self.push(id).await?;
                self.set_status(id, AutoRecordStatus::Queued, None).await;
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(requeued, "stranded results re-enqueued");
        }
        Ok(requeued)
    }

    pub async fn queue_depth(&self) -> Result<u64> {
        let key = self.deps.cache.keys().auto_record_queue();
        Ok(self.deps.cache.backend().llen(&key).await?)
    }

    pub async fn failed_count(&self) -> Result<u64> {
        let key = self.deps.cache.keys().auto_record_failed();
        Ok(self.deps.cache.backend().scard(&key).await?)
    }
}
