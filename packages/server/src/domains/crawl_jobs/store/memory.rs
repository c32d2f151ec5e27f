use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DoneCursor, FailureOutcome, FailureReport, JobStore};
use crate::common::{JobId, ResultId, TransitionError};
use crate::domains::crawl_jobs::models::{
    AutoRecordStatus, CrawlJob, CrawlResult, JobSelection, JobStatus, SuccessReport,
};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, CrawlJob>,
    /// Keyed by job: one result per job.
    results: HashMap<JobId, CrawlResult>,
}

/// Job store held in process memory. Each operation runs under one mutex,
/// which gives the same all-or-nothing transitions as the SQL store.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    /// Upcoming `reset_to_pending` calls that fail as a store outage would.
    reset_failures: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `times` resets with a store error.
    pub fn fail_next_resets(&self, times: usize) {
        self.reset_failures.store(times, Ordering::SeqCst);
    }

    /// Every job currently stored, in creation order.
    pub fn all_jobs(&self) -> Vec<CrawlJob> {
        let mut jobs: Vec<_> = self.state().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        jobs
    }

    /// Overwrite a job as-is. Test setup only needs this to fake history.
    pub fn put_job(&self, job: CrawlJob) {
        self.state().jobs.insert(job.id, job);
    }

    fn store_result(state: &mut State, result: CrawlResult) -> CrawlResult {
        let result = match state.results.get(&result.job_id) {
            Some(previous) => result.replacing(previous),
            None => result,
        };
        state.results.insert(result.job_id, result.clone());
        result
    }

    fn result_mut(state: &mut State, id: ResultId) -> Option<&mut CrawlResult> {
        state.results.values_mut().find(|r| r.id == id)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        let mut state = self.state();
        if state.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<CrawlJob>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn lease_candidates(
        &self,
        target_group: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let state = self.state();
        let mut candidates: Vec<CrawlJob> = state
            .jobs
            .values()
            .filter(|job| job.can_acquire(now))
            .filter(|job| target_group.map_or(true, |g| job.target_group.eq_ignore_ascii_case(g)))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn acquire_lease(
        &self,
        id: JobId,
        bot_id: &str,
        ttl_override: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>> {
        let mut state = self.state();
        Ok(state
            .jobs
            .get_mut(&id)
            .filter(|job| job.can_acquire(now))
            .map(|job| {
                job.acquire(bot_id, ttl_override, now);
                job.clone()
            }))
    }

    async fn complete_success(
        &self,
        id: JobId,
        bot_id: &str,
        report: SuccessReport,
        now: DateTime<Utc>,
    ) -> Result<(CrawlJob, CrawlResult), TransitionError> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&id).ok_or(TransitionError::NotFound(id))?;
        job.complete_success(bot_id, now)?;
        let job = job.clone();

        let result = Self::store_result(&mut state, CrawlResult::success(&job, report, now));
        Ok((job, result))
    }

    async fn complete_failure(
        &self,
        id: JobId,
        bot_id: &str,
        failure: FailureReport,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&id).ok_or(TransitionError::NotFound(id))?;
        let will_retry = job.complete_failure(bot_id, &failure.message, failure.auto_retry, now)?;
        let job = job.clone();

        let result = Self::store_result(
            &mut state,
            CrawlResult::failure(&job, &failure.message, will_retry, now),
        );
        Ok(FailureOutcome {
            job,
            result,
            will_retry,
        })
    }

    async fn expire(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .state()
            .jobs
            .get_mut(&id)
            .map_or(false, |job| job.expire(now)))
    }

    async fn reset_to_pending(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        if self
            .reset_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("job store unavailable");
        }
        Ok(self
            .state()
            .jobs
            .get_mut(&id)
            .map_or(false, |job| job.reset_to_pending(now)))
    }

    async fn done_jobs(
        &self,
        selection: &JobSelection,
        after: Option<DoneCursor>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let state = self.state();
        let mut jobs: Vec<CrawlJob> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Done && selection.matches(job))
            .filter(|job| after.map_or(true, |cursor| (job.updated_at, job.id) > cursor))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.updated_at, a.id).cmp(&(b.updated_at, b.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn find_result(&self, id: ResultId) -> Result<Option<CrawlResult>> {
        Ok(self.state().results.values().find(|r| r.id == id).cloned())
    }

    async fn find_result_for_job(&self, job_id: JobId) -> Result<Option<CrawlResult>> {
        Ok(self.state().results.get(&job_id).cloned())
    }

    async fn set_auto_record_status(
        &self,
        id: ResultId,
        status: AutoRecordStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let result = Self::result_mut(&mut state, id)
            .ok_or_else(|| anyhow::anyhow!("result {} not found", id))?;
        result.auto_record_status = status;
        result.auto_record_reason = reason.map(str::to_string);
        result.auto_record_updated_at = at;
        Ok(())
    }

    async fn mark_recorded(&self, id: ResultId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let result = Self::result_mut(&mut state, id)
            .ok_or_else(|| anyhow::anyhow!("result {} not found", id))?;
        result.recorded = true;
        result.auto_record_status = AutoRecordStatus::Completed;
        result.auto_record_reason = Some(reason.to_string());
        result.auto_record_updated_at = at;
        Ok(())
    }

    async fn results_with_status(
        &self,
        status: AutoRecordStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResultId>> {
        let state = self.state();
        let mut results: Vec<&CrawlResult> = state
            .results
            .values()
            .filter(|r| r.succeeded && r.auto_record_status == status)
            .filter(|r| r.auto_record_updated_at <= changed_before)
            .collect();
        results.sort_by_key(|r| (r.auto_record_updated_at, r.id));
        Ok(results
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| r.id)
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
