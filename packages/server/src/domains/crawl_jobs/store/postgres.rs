use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{DoneCursor, FailureOutcome, FailureReport, JobStore};
use crate::common::{JobId, LeaseConflict, ResultId, TransitionError};
use crate::domains::crawl_jobs::models::{
    AutoRecordStatus, CrawlJob, CrawlResult, JobSelection, JobStatus, SuccessReport,
};

const JOB_COLUMNS: &str = "id, target_ref, target_group, status, priority, max_retries, retry_count, \
     lock_owner, lock_acquired_at, lock_ttl_seconds, expired_owner, last_error, tag, created_at, updated_at";

const RESULT_COLUMNS: &str = "id, job_id, target_ref, price, currency, title, in_stock, raw_payload, \
     structured_payload, succeeded, observed_at, created_at, auto_record_status, auto_record_reason, \
     auto_record_updated_at, recorded";

/// `lock_acquired_at + lock_ttl_seconds`, as a SQL expression.
const LEASE_EXPIRY: &str = "lock_acquired_at + lock_ttl_seconds * INTERVAL '1 second'";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Work out which guard rejected a conditional update that touched no row.
    async fn diagnose(&self, id: JobId, bot_id: &str, now: DateTime<Utc>) -> TransitionError {
        match self.find_job(id).await {
            Ok(None) => TransitionError::NotFound(id),
            Ok(Some(job)) => match job.check_submission(bot_id, now) {
                Err(conflict) => conflict.into(),
                // The row changed between the update and the re-read.
                Ok(()) => LeaseConflict::NotLocked.into(),
            },
            Err(e) => TransitionError::Store(e),
        }
    }

    async fn upsert_result(
        tx: &mut Transaction<'_, Postgres>,
        result: &CrawlResult,
    ) -> Result<CrawlResult> {
        let sql = format!(
            r#"
            INSERT INTO crawl_results ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (job_id) DO UPDATE SET
                target_ref = EXCLUDED.target_ref,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                title = EXCLUDED.title,
                in_stock = EXCLUDED.in_stock,
                raw_payload = EXCLUDED.raw_payload,
                structured_payload = EXCLUDED.structured_payload,
                succeeded = EXCLUDED.succeeded,
                observed_at = EXCLUDED.observed_at,
                auto_record_status = EXCLUDED.auto_record_status,
                auto_record_reason = EXCLUDED.auto_record_reason,
                auto_record_updated_at = EXCLUDED.auto_record_updated_at,
                recorded = FALSE
            RETURNING {cols}
            "#,
            cols = RESULT_COLUMNS
        );

        let row = sqlx::query_as::<_, CrawlResult>(&sql)
            .bind(result.id)
            .bind(result.job_id)
            .bind(&result.target_ref)
            .bind(result.price)
            .bind(&result.currency)
            .bind(&result.title)
            .bind(result.in_stock)
            .bind(&result.raw_payload)
            .bind(&result.structured_payload)
            .bind(result.succeeded)
            .bind(result.observed_at)
            .bind(result.created_at)
            .bind(result.auto_record_status)
            .bind(&result.auto_record_reason)
            .bind(result.auto_record_updated_at)
            .bind(result.recorded)
            .fetch_one(&mut **tx)
            .await
            .context("failed to upsert crawl result")?;

        Ok(row)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO crawl_jobs ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(&job.target_ref)
        .bind(&job.target_group)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.max_retries)
        .bind(job.retry_count)
        .bind(&job.lock_owner)
        .bind(job.lock_acquired_at)
        .bind(job.lock_ttl_seconds)
        .bind(&job.expired_owner)
        .bind(&job.last_error)
        .bind(&job.tag)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert crawl job")?;

        Ok(())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<CrawlJob>> {
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            "SELECT {} FROM crawl_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn lease_candidates(
        &self,
        target_group: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let jobs = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            SELECT {cols}
            FROM crawl_jobs
            WHERE (status = 'PENDING' OR (status = 'LOCKED' AND {expiry} < $1))
              AND ($2::TEXT IS NULL OR lower(target_group) = lower($2))
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $3
            "#,
            cols = JOB_COLUMNS,
            expiry = LEASE_EXPIRY
        ))
        .bind(now)
        .bind(target_group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn acquire_lease(
        &self,
        id: JobId,
        bot_id: &str,
        ttl_override: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlJob>> {
        // A stale holder is remembered in expired_owner so its late submit is
        // answered with lease_expired.
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            UPDATE crawl_jobs
            SET status = 'LOCKED',
                expired_owner = CASE WHEN status = 'LOCKED' THEN lock_owner ELSE NULL END,
                lock_owner = $2,
                lock_acquired_at = $4,
                lock_ttl_seconds = COALESCE($3, lock_ttl_seconds),
                updated_at = $4
            WHERE id = $1
              AND (status = 'PENDING' OR (status = 'LOCKED' AND {expiry} < $4))
            RETURNING {cols}
            "#,
            cols = JOB_COLUMNS,
            expiry = LEASE_EXPIRY
        ))
        .bind(id)
        .bind(bot_id)
        .bind(ttl_override)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete_success(
        &self,
        id: JobId,
        bot_id: &str,
        report: SuccessReport,
        now: DateTime<Utc>,
    ) -> Result<(CrawlJob, CrawlResult), TransitionError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            UPDATE crawl_jobs
            SET status = 'DONE',
                lock_owner = NULL,
                lock_acquired_at = NULL,
                expired_owner = NULL,
                retry_count = 0,
                last_error = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'LOCKED' AND lock_owner = $2 AND {expiry} >= $3
            RETURNING {cols}
            "#,
            cols = JOB_COLUMNS,
            expiry = LEASE_EXPIRY
        ))
        .bind(id)
        .bind(bot_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            debug!(job_id = %id, bot_id, "success submission rejected by lease guard");
            return Err(self.diagnose(id, bot_id, now).await);
        };

        let result = Self::upsert_result(&mut tx, &CrawlResult::success(&job, report, now)).await?;
        tx.commit().await?;

        Ok((job, result))
    }

    async fn complete_failure(
        &self,
        id: JobId,
        bot_id: &str,
        failure: FailureReport,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        let mut tx = self.pool.begin().await?;

        // SET expressions read the pre-update row.
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            UPDATE crawl_jobs
            SET retry_count = LEAST(retry_count + 1, max_retries),
                status = CASE
                    WHEN $4 AND retry_count + 1 < max_retries THEN 'PENDING'::crawl_job_status
                    ELSE 'FAILED'::crawl_job_status
                END,
                lock_owner = NULL,
                lock_acquired_at = NULL,
                expired_owner = NULL,
                last_error = $5,
                updated_at = $3
            WHERE id = $1 AND status = 'LOCKED' AND lock_owner = $2 AND {expiry} >= $3
            RETURNING {cols}
            "#,
            cols = JOB_COLUMNS,
            expiry = LEASE_EXPIRY
        ))
        .bind(id)
        .bind(bot_id)
        .bind(now)
        .bind(failure.auto_retry)
        .bind(&failure.message)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            debug!(job_id = %id, bot_id, "failure submission rejected by lease guard");
            return Err(self.diagnose(id, bot_id, now).await);
        };

        let will_retry = job.status == JobStatus::Pending;
        let result = Self::upsert_result(
            &mut tx,
            &CrawlResult::failure(&job, &failure.message, will_retry, now),
        )
        .await?;
        tx.commit().await?;

        Ok(FailureOutcome {
            job,
            result,
            will_retry,
        })
    }

    async fn expire(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE crawl_jobs
            SET status = 'EXPIRED',
                expired_owner = lock_owner,
                lock_owner = NULL,
                lock_acquired_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'LOCKED' AND {} < $2
            "#,
            LEASE_EXPIRY
        ))
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn reset_to_pending(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'PENDING',
                lock_owner = NULL,
                lock_acquired_at = NULL,
                expired_owner = NULL,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'DONE'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn done_jobs(
        &self,
        selection: &JobSelection,
        after: Option<DoneCursor>,
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let (filter, selector) = match selection {
            JobSelection::All => ("TRUE", None),
            JobSelection::TargetGroup(group) => ("lower(target_group) = lower($4)", Some(group.clone())),
            JobSelection::TargetPattern(re) => ("target_ref ~ $4", Some(re.as_str().to_string())),
            JobSelection::Tag(tag) => ("tag = $4", Some(tag.clone())),
        };

        let sql = format!(
            r#"
            SELECT {cols}
            FROM crawl_jobs
            WHERE status = 'DONE' AND {filter}
              AND ($2::timestamptz IS NULL OR (updated_at, id) > ($2, $3))
            ORDER BY updated_at ASC, id ASC
            LIMIT $1
            "#,
            cols = JOB_COLUMNS,
            filter = filter
        );

        let query = sqlx::query_as::<_, CrawlJob>(&sql)
            .bind(limit)
            .bind(after.map(|(at, _)| at))
            .bind(after.map(|(_, id)| id));
        let query = match selector {
            Some(selector) => query.bind(selector),
            None => query,
        };
        let jobs = query.fetch_all(&self.pool).await?;

        Ok(jobs)
    }

    async fn find_result(&self, id: ResultId) -> Result<Option<CrawlResult>> {
        let result = sqlx::query_as::<_, CrawlResult>(&format!(
            "SELECT {} FROM crawl_results WHERE id = $1",
            RESULT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn find_result_for_job(&self, job_id: JobId) -> Result<Option<CrawlResult>> {
        let result = sqlx::query_as::<_, CrawlResult>(&format!(
            "SELECT {} FROM crawl_results WHERE job_id = $1",
            RESULT_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    async fn set_auto_record_status(
        &self,
        id: ResultId,
        status: AutoRecordStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_results
            SET auto_record_status = $2, auto_record_reason = $3, auto_record_updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_recorded(&self, id: ResultId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_results
            SET recorded = TRUE, auto_record_status = 'completed', auto_record_reason = $2,
                auto_record_updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn results_with_status(
        &self,
        status: AutoRecordStatus,
        changed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResultId>> {
        let ids = sqlx::query_scalar::<_, ResultId>(
            r#"
            SELECT id FROM crawl_results
            WHERE succeeded AND auto_record_status = $1 AND auto_record_updated_at <= $2
            ORDER BY auto_record_updated_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(status)
        .bind(changed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
