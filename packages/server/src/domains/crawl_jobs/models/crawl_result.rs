use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::crawl_job::CrawlJob;
use super::payload::{FailureRecord, StructuredPayload};
use crate::common::{JobId, ResultId};

/// Currency recorded on failure results, which carry no real price.
pub const NO_CURRENCY: &str = "XXX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "auto_record_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AutoRecordStatus {
    #[default]
    Unevaluated,
    Eligible,
    Ineligible,
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Outcome of one terminal submission; one row per job, replaced on retry.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub id: ResultId,
    pub job_id: JobId,
    pub target_ref: String,
    pub price: Decimal,
    pub currency: String,
    pub title: Option<String>,
    pub in_stock: bool,
    pub raw_payload: Option<serde_json::Value>,
    pub structured_payload: Json<StructuredPayload>,
    pub succeeded: bool,
    pub observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub auto_record_status: AutoRecordStatus,
    pub auto_record_reason: Option<String>,
    /// Last auto-record status change.
    pub auto_record_updated_at: DateTime<Utc>,
    /// Set once the result has been written to price history.
    pub recorded: bool,
}

/// What a bot reports on success.
#[derive(Debug, Clone)]
pub struct SuccessReport {
    pub price: Decimal,
    pub currency: String,
    pub title: Option<String>,
    pub in_stock: bool,
    pub raw_payload: Option<serde_json::Value>,
    pub structured_payload: StructuredPayload,
}

impl CrawlResult {
    pub fn success(job: &CrawlJob, report: SuccessReport, now: DateTime<Utc>) -> Self {
        Self {
            id: ResultId::new(),
            job_id: job.id,
            target_ref: job.target_ref.clone(),
            price: report.price,
            currency: report.currency,
            title: report.title,
            in_stock: report.in_stock,
            raw_payload: report.raw_payload,
            structured_payload: Json(report.structured_payload),
            succeeded: true,
            observed_at: now,
            created_at: now,
            auto_record_status: AutoRecordStatus::Unevaluated,
            auto_record_reason: None,
            auto_record_updated_at: now,
            recorded: false,
        }
    }

    /// Audit row for a failed attempt: zero price, failure in the payload.
    /// `job` is the state after the failure transition.
    pub fn failure(job: &CrawlJob, message: &str, will_retry: bool, now: DateTime<Utc>) -> Self {
        let payload = StructuredPayload {
            sources: Vec::new(),
            failure: Some(FailureRecord {
                message: message.to_string(),
                retry_count: job.retry_count,
                max_retries: job.max_retries,
                will_retry,
            }),
        };

        Self {
            id: ResultId::new(),
            job_id: job.id,
            target_ref: job.target_ref.clone(),
            price: Decimal::ZERO,
            currency: NO_CURRENCY.to_string(),
            title: None,
            in_stock: false,
            raw_payload: None,
            structured_payload: Json(payload),
            succeeded: false,
            observed_at: now,
            created_at: now,
            auto_record_status: AutoRecordStatus::Ineligible,
            auto_record_reason: Some("crawl did not succeed".to_string()),
            auto_record_updated_at: now,
            recorded: false,
        }
    }

    /// Carry the identity of the row being replaced so the upsert keeps it.
    pub fn replacing(mut self, previous: &CrawlResult) -> Self {
        self.id = previous.id;
        self.created_at = previous.created_at;
        self
    }
}
