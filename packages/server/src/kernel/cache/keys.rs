use crate::common::{JobId, ResultId};

/// Deterministic key builder.
///
/// Every key the coordinator writes to the backend is produced here so the
/// prefix used by `clear_pattern` always matches what was set.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn key(&self, rest: &str) -> String {
        if self.namespace.is_empty() {
            rest.to_string()
        } else {
            format!("{}::{}", self.namespace, rest)
        }
    }

    /// `pending-jobs::<target-group-or-'all'>`
    pub fn pending_jobs(&self, target_group: Option<&str>) -> String {
        self.key(&format!("pending-jobs::{}", target_group.unwrap_or("all")))
    }

    pub fn pending_jobs_prefix(&self) -> String {
        self.key("pending-jobs::")
    }

    pub fn job(&self, job_id: JobId) -> String {
        self.key(&format!("job::{}", job_id))
    }

    pub fn bot_stats(&self, bot_id: &str) -> String {
        self.key(&format!("bot-stats::{}", bot_id))
    }

    /// Per-minute pull counter; `minute` is the unix minute.
    pub fn bot_rate(&self, bot_id: &str, minute: i64) -> String {
        self.key(&format!("bot-rate::{}::{}", bot_id, minute))
    }

    pub fn reset_index(&self) -> String {
        self.key("reset-index")
    }

    pub fn auto_record_queue(&self) -> String {
        self.key("auto-record::queue")
    }

    pub fn auto_record_failed(&self) -> String {
        self.key("auto-record::failed")
    }

    pub fn auto_record_processing(&self, result_id: ResultId) -> String {
        self.key(&format!("auto-record::processing::{}", result_id))
    }

    pub fn auto_record_failures(&self, result_id: ResultId) -> String {
        self.key(&format!("auto-record::failures::{}", result_id))
    }
}
