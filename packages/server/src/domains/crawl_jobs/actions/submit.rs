//! Submit: accept a bot's outcome for a job it holds a live lease on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{CoordinatorError, JobId, LeaseConflict, ResultId};
use crate::domains::auto_record::AutoRecordPipeline;
use crate::domains::bots::{authenticate, BotIdentity, SubmitOutcome};
use crate::domains::crawl_jobs::models::{CrawlJob, StructuredPayload, SuccessReport};
use crate::domains::crawl_jobs::store::FailureReport;
use crate::domains::reset::DeferredResetScheduler;
use crate::kernel::ServerDeps;

const DEFAULT_FAILURE_MESSAGE: &str = "crawl failed without an error message";

/// Wire form of a submission. Which fields are required depends on `success`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub bot_id: String,
    pub credential: String,
    pub job_id: String,
    pub success: bool,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub in_stock: Option<bool>,
    #[serde(default)]
    pub raw_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub structured_payload: Option<StructuredPayload>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Failure only; `false` moves the job straight to FAILED.
    #[serde(default)]
    pub retry: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum Submission {
    Success(SuccessReport),
    Failure(FailureReport),
}

impl SubmitRequest {
    pub fn job_id(&self) -> Result<JobId, CoordinatorError> {
        JobId::parse(self.job_id.trim())
            .map_err(|_| CoordinatorError::validation(format!("invalid job_id: {}", self.job_id)))
    }

    pub fn submission(&self) -> Result<Submission, CoordinatorError> {
        if !self.success {
            let message = self
                .error_message
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_FAILURE_MESSAGE)
                .to_string();
            return Ok(Submission::Failure(FailureReport {
                message,
                auto_retry: self.retry.unwrap_or(true),
            }));
        }

        let price = self
            .price
            .ok_or_else(|| CoordinatorError::validation("price is required on success"))?;
        if price.is_sign_negative() {
            return Err(CoordinatorError::validation("price must not be negative"));
        }

        let currency = self
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CoordinatorError::validation("currency is required on success"))?;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoordinatorError::validation(format!(
                "currency must be a three-letter code, got {}",
                currency
            )));
        }

        Ok(Submission::Success(SuccessReport {
            price,
            currency: currency.to_uppercase(),
            title: self.title.clone(),
            in_stock: self.in_stock.unwrap_or(true),
            raw_payload: self.raw_payload.clone(),
            structured_payload: self.structured_payload.clone().unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmitResponse {
    Done {
        result_id: ResultId,
        job_id: JobId,
        price: Decimal,
        currency: String,
        next_reset_at: DateTime<Utc>,
    },
    Pending {
        job_id: JobId,
        retry_count: i32,
        max_retries: i32,
        message: String,
    },
    Failed {
        job_id: JobId,
        retry_count: i32,
        max_retries: i32,
        error: String,
        message: String,
    },
}

pub struct SubmitService {
    deps: Arc<ServerDeps>,
    scheduler: Arc<DeferredResetScheduler>,
    pipeline: Arc<AutoRecordPipeline>,
}

impl SubmitService {
    pub fn new(
        deps: Arc<ServerDeps>,
        scheduler: Arc<DeferredResetScheduler>,
        pipeline: Arc<AutoRecordPipeline>,
    ) -> Self {
        Self {
            deps,
            scheduler,
            pipeline,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, CoordinatorError> {
        let bot = authenticate(
            self.deps.bot_registry.as_ref(),
            &request.bot_id,
            &request.credential,
        )
        .await?;
        let job_id = request.job_id()?;
        let submission = request.submission()?;

        let now = self.deps.clock.now();
        let (job, cached) = self.load_job(job_id).await?;
        if let Err(conflict) = job.check_submission(&bot.bot_id, now) {
            // A cached copy may predate this bot's lease; only the store can refuse.
            let fresh = if cached {
                self.fetch_job(job_id).await?.check_submission(&bot.bot_id, now)
            } else {
                Err(conflict)
            };
            if let Err(conflict) = fresh {
                return Err(self.reject(job_id, &bot, conflict.into(), now).await);
            }
        }

        match submission {
            Submission::Success(report) => self.accept_success(&bot, job_id, report, now).await,
            Submission::Failure(failure) => self.accept_failure(&bot, job_id, failure, now).await,
        }
    }

    /// Job via the per-job cache entry, and whether it came from the cache.
    async fn load_job(&self, job_id: JobId) -> Result<(CrawlJob, bool), CoordinatorError> {
        let key = self.deps.cache.keys().job(job_id);
        if let Some(job) = self.deps.cache.get_json::<CrawlJob>(&key).await {
            return Ok((job, true));
        }

        let job = self.fetch_job(job_id).await?;
        let ttl = self.deps.cache.config().job_ttl;
        self.deps.cache.set_json(&key, &job, ttl).await;
        Ok((job, false))
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<CrawlJob, CoordinatorError> {
        self.deps
            .job_store
            .find_job(job_id)
            .await?
            .ok_or(CoordinatorError::NotFound(job_id))
    }

    /// Log a refused submission, expiring the job when its lease lapsed.
    async fn reject(
        &self,
        job_id: JobId,
        bot: &BotIdentity,
        err: CoordinatorError,
        now: DateTime<Utc>,
    ) -> CoordinatorError {
        if matches!(err, CoordinatorError::LeaseConflict(LeaseConflict::LeaseExpired)) {
            match self.deps.job_store.expire(job_id, now).await {
                Ok(true) => info!(job_id = %job_id, bot_id = %bot.bot_id, "expired stale lease on late submission"),
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to expire stale lease"),
            }
            self.deps.cache.invalidate_job(job_id).await;
        }

        match &err {
            CoordinatorError::LeaseConflict(conflict) => {
                warn!(job_id = %job_id, bot_id = %bot.bot_id, code = conflict.code(), "submission rejected")
            }
            CoordinatorError::Internal(e) => {
                warn!(job_id = %job_id, bot_id = %bot.bot_id, error = %e, "submission failed")
            }
            _ => {}
        }
        err
    }

    async fn record_submit(&self, bot: &BotIdentity, outcome: SubmitOutcome, now: DateTime<Utc>) {
        if let Err(e) = self
            .deps
            .bot_registry
            .record_submit(&bot.bot_id, outcome, now)
            .await
        {
            warn!(bot_id = %bot.bot_id, error = %e, "failed to record submit stats");
        }
        self.deps.cache.invalidate_bot_stats(&bot.bot_id).await;
    }

    async fn accept_success(
        &self,
        bot: &BotIdentity,
        job_id: JobId,
        report: SuccessReport,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse, CoordinatorError> {
        let (job, result) = match self
            .deps
            .job_store
            .complete_success(job_id, &bot.bot_id, report, now)
            .await
        {
            Ok(done) => done,
            Err(e) => return Err(self.reject(job_id, bot, e.into(), now).await),
        };

        self.deps.cache.invalidate_job(job.id).await;
        self.record_submit(bot, SubmitOutcome::Completed, now).await;

        let next_reset_at = self.scheduler.schedule_after_success(&job).await;
        let eligibility = self.pipeline.enqueue(&result).await;

        info!(
            job_id = %job.id,
            bot_id = %bot.bot_id,
            price = %result.price,
            currency = %result.currency,
            auto_record = eligibility.is_eligible(),
            %next_reset_at,
            "job completed"
        );

        Ok(SubmitResponse::Done {
            result_id: result.id,
            job_id: job.id,
            price: result.price,
            currency: result.currency,
            next_reset_at,
        })
    }

    async fn accept_failure(
        &self,
        bot: &BotIdentity,
        job_id: JobId,
        failure: FailureReport,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse, CoordinatorError> {
        let error = failure.message.clone();
        let outcome = match self
            .deps
            .job_store
            .complete_failure(job_id, &bot.bot_id, failure, now)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.reject(job_id, bot, e.into(), now).await),
        };

        self.deps.cache.invalidate_job(job_id).await;
        self.record_submit(bot, SubmitOutcome::Failed, now).await;

        let job = &outcome.job;
        if outcome.will_retry {
            self.deps
                .cache
                .clear_pattern(&self.deps.cache.keys().pending_jobs_prefix())
                .await;
            info!(job_id = %job.id, bot_id = %bot.bot_id, retry_count = job.retry_count, "job failed, will retry");
            Ok(SubmitResponse::Pending {
                job_id: job.id,
                retry_count: job.retry_count,
                max_retries: job.max_retries,
                message: format!(
                    "crawl failed, will retry (attempt {} of {})",
                    job.retry_count, job.max_retries
                ),
            })
        } else {
            warn!(job_id = %job.id, bot_id = %bot.bot_id, error = %error, "job failed permanently");
            Ok(SubmitResponse::Failed {
                job_id: job.id,
                retry_count: job.retry_count,
                max_retries: job.max_retries,
                message: format!(
                    "retries exhausted ({} of {})",
                    job.retry_count, job.max_retries
                ),
                error,
            })
        }
    }
}
