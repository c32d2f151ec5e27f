use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{JobId, LeaseConflict};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawl_job_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Locked,
    Done,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Locked => "locked",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CrawlJob
// ============================================================================

/// A unit of crawl work and its lease.
///
/// Lease fields (`lock_owner`, `lock_acquired_at`) are only meaningful while
/// `status == Locked`; every mutator below keeps that pairing intact.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: JobId,
    pub target_ref: String,
    pub target_group: String,
    pub status: JobStatus,
    pub priority: i32,
    pub max_retries: i32,
    pub retry_count: i32,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_ttl_seconds: i64,
    /// Bot whose lease lapsed most recently; lets a late submission be told
    /// `lease_expired` instead of `not_assigned`.
    pub expired_owner: Option<String>,
    pub last_error: Option<String>,
    pub tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lock_acquired_at
            .map(|at| at + chrono::Duration::seconds(self.lock_ttl_seconds))
    }

    /// True once `now > lock_acquired_at + lock_ttl_seconds` on a locked job.
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Locked
            && self.lease_expires_at().map_or(false, |expires| now > expires)
    }

    pub fn is_held_by(&self, bot_id: &str) -> bool {
        self.status == JobStatus::Locked && self.lock_owner.as_deref() == Some(bot_id)
    }

    /// LOCKED iff a lock owner and acquisition time are both present.
    pub fn lease_invariant_holds(&self) -> bool {
        let has_lease = self.lock_owner.as_deref().map_or(false, |o| !o.is_empty())
            && self.lock_acquired_at.is_some();
        (self.status == JobStatus::Locked) == has_lease
            && self.retry_count <= self.max_retries
    }

    pub fn can_acquire(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Locked => self.is_lock_expired(now),
            _ => false,
        }
    }

    /// Lease guard applied to a terminal submission from `bot_id`.
    pub fn check_submission(&self, bot_id: &str, now: DateTime<Utc>) -> Result<(), LeaseConflict> {
        if self.expired_owner.as_deref() == Some(bot_id) && !self.is_held_by(bot_id) {
            return Err(LeaseConflict::LeaseExpired);
        }
        if self.status != JobStatus::Locked {
            return Err(LeaseConflict::NotLocked);
        }
        if self.lock_owner.as_deref() != Some(bot_id) {
            return Err(LeaseConflict::NotOwner);
        }
        if self.is_lock_expired(now) {
            return Err(LeaseConflict::LeaseExpired);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transitions. Callers hold whatever exclusion the store provides; these
    // return false (or an error) instead of mutating when the guard fails.
    // ------------------------------------------------------------------------

    pub fn acquire(&mut self, bot_id: &str, ttl_override: Option<i64>, now: DateTime<Utc>) -> bool {
        if !self.can_acquire(now) {
            return false;
        }
        self.expired_owner = match self.status {
            JobStatus::Locked => self.lock_owner.take(),
            _ => None,
        };
        self.status = JobStatus::Locked;
        self.lock_owner = Some(bot_id.to_string());
        self.lock_acquired_at = Some(now);
        if let Some(ttl) = ttl_override {
            self.lock_ttl_seconds = ttl;
        }
        self.updated_at = now;
        true
    }

    pub fn complete_success(&mut self, bot_id: &str, now: DateTime<Utc>) -> Result<(), LeaseConflict> {
        self.check_submission(bot_id, now)?;
        self.status = JobStatus::Done;
        self.clear_lease();
        self.expired_owner = None;
        self.retry_count = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Returns whether the job went back to PENDING for another attempt.
    pub fn complete_failure(
        &mut self,
        bot_id: &str,
        error: &str,
        auto_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseConflict> {
        self.check_submission(bot_id, now)?;
        let attempts = self.retry_count + 1;
        let will_retry = auto_retry && attempts < self.max_retries;
        self.retry_count = attempts.min(self.max_retries);
        self.status = if will_retry {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        self.clear_lease();
        self.expired_owner = None;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
        Ok(will_retry)
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_lock_expired(now) {
            return false;
        }
        self.status = JobStatus::Expired;
        self.expired_owner = self.lock_owner.take();
        self.lock_acquired_at = None;
        self.updated_at = now;
        true
    }

    /// DONE -> PENDING, used by the deferred reset scheduler.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Done {
            return false;
        }
        self.status = JobStatus::Pending;
        self.clear_lease();
        self.expired_owner = None;
        self.last_error = None;
        self.updated_at = now;
        true
    }

    fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lock_acquired_at = None;
    }
}

// ============================================================================
// NewCrawlJob
// ============================================================================

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewCrawlJob {
    pub target_ref: String,
    /// Defaults to the host of `target_ref`.
    #[builder(default, setter(strip_option))]
    pub target_group: Option<String>,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub lock_ttl_seconds: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub tag: Option<String>,
}

impl NewCrawlJob {
    pub fn into_job(self, default_ttl_seconds: i64, now: DateTime<Utc>) -> CrawlJob {
        let target_group = self
            .target_group
            .unwrap_or_else(|| default_target_group(&self.target_ref));

        CrawlJob {
            id: JobId::new(),
            target_ref: self.target_ref,
            target_group,
            status: JobStatus::Pending,
            priority: self.priority,
            max_retries: self.max_retries.max(0),
            retry_count: 0,
            lock_owner: None,
            lock_acquired_at: None,
            lock_ttl_seconds: self.lock_ttl_seconds.unwrap_or(default_ttl_seconds),
            expired_owner: None,
            last_error: None,
            tag: self.tag,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Host of the target URL, or the raw reference when it is not a URL.
pub fn default_target_group(target_ref: &str) -> String {
    url::Url::parse(target_ref)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_else(|| target_ref.to_string())
}
