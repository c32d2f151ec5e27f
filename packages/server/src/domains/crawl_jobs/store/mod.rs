//! Authoritative job store.
//!
//! Every state transition is a single conditional write: it succeeds only if
//! the row still satisfies the transition's precondition, so concurrent
//! callers can never both win the same job.

mod memory;
mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{AutoRecordStatus, CrawlJob, CrawlResult, JobSelection, SuccessReport};
use crate::common::{JobId, ResultId, TransitionError};

/// Keyset position in the `(updated_at, id)` order of [`JobStore::done_jobs`].
pub type DoneCursor = (DateTime<Utc>, JobId);

/// Failure reported by a bot.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub message: String,
    pub auto_retry: bool,
}

/// Job state after a failure submission plus its audit result.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub job: CrawlJob,
    pub result: CrawlResult,
    pub will_retry: bool,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &CrawlJob) -> Result<()>;

    async fn find_job(&self, id: JobId) -> Result<Option<CrawlJob>>;

    /// Jobs a pull may lease: PENDING, plus LOCKED with a stale lease,
    /// ordered `priority desc, created_at asc`.
    async fn lease_candidates(
        &self,
        target_group: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>>;

    /// Take the lease if the job is PENDING or its lease is stale.
    /// `None` means another bot holds a live lease (or the job left PENDING).
    async fn acquire_lease(
        &self,
        id: JobId,
        bot_id: &str,
        ttl_override: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>>;

    /// LOCKED by `bot_id` with a live lease -> DONE, upserting the result.
    async fn complete_success(
        &self,
        id: JobId,
        bot_id: &str,
        report: SuccessReport,
        now: DateTime<Utc>,
    ) -> Result<(CrawlJob, CrawlResult), TransitionError>;

    /// LOCKED by `bot_id` with a live lease -> PENDING or FAILED, upserting
    /// an audit result.
    async fn complete_failure(
        &self,
        id: JobId,
        bot_id: &str,
        failure: FailureReport,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError>;

    /// LOCKED with a stale lease -> EXPIRED. Returns whether it applied.
    async fn expire(&self, id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// DONE -> PENDING. Returns whether it applied.
    async fn reset_to_pending(&self, id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// DONE jobs matching `selection`, least recently updated first, starting
    /// strictly after `after` when paging.
    async fn done_jobs(
        &self,
        selection: &JobSelection,
        after: Option<DoneCursor>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>>;

    async fn find_result(&self, id: ResultId) -> Result<Option<CrawlResult>>;

    async fn find_result_for_job(&self, job_id: JobId) -> Result<Option<CrawlResult>>;

    async fn set_auto_record_status(
        &self,
        id: ResultId,
        status: AutoRecordStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Flag the result as written to price history and complete it.
    async fn mark_recorded(&self, id: ResultId, reason: &str, at: DateTime<Utc>) -> Result<()>;

    /// Successful results at `status` whose status last changed at or before
    /// `changed_before`, longest-waiting first.
    async fn results_with_status(
        &self,
        status: AutoRecordStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResultId>>;

    async fn ping(&self) -> Result<()>;
}
