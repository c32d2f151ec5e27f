use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::credentials::hash_credential;

/// Registry entry for a crawling bot.
#[derive(FromRow, Debug, Clone, PartialEq)]
pub struct BotIdentity {
    pub bot_id: String,
    /// Hex sha256 of the bot's credential; the plaintext is never stored.
    pub credential_hash: String,
    pub enabled: bool,
    pub max_jobs_per_pull: i64,
    pub custom_lock_ttl_seconds: Option<i64>,
    pub rate_limit_per_minute: Option<i64>,
    /// Target group this bot is restricted to.
    pub allowed_target_filter: Option<String>,
    pub pulled: i64,
    pub completed: i64,
    pub failed: i64,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_submit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BotIdentity {
    pub fn new(bot_id: impl Into<String>, credential: &str, now: DateTime<Utc>) -> Self {
        Self {
            bot_id: bot_id.into(),
            credential_hash: hash_credential(credential),
            enabled: true,
            max_jobs_per_pull: 10,
            custom_lock_ttl_seconds: None,
            rate_limit_per_minute: None,
            allowed_target_filter: None,
            pulled: 0,
            completed: 0,
            failed: 0,
            last_pull_at: None,
            last_submit_at: None,
            created_at: now,
        }
    }

    pub fn with_max_jobs_per_pull(mut self, max: i64) -> Self {
        self.max_jobs_per_pull = max;
        self
    }

    pub fn with_lock_ttl(mut self, seconds: i64) -> Self {
        self.custom_lock_ttl_seconds = Some(seconds);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: i64) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn with_target_filter(mut self, group: impl Into<String>) -> Self {
        self.allowed_target_filter = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn stats(&self) -> BotStats {
        BotStats {
            bot_id: self.bot_id.clone(),
            enabled: self.enabled,
            pulled: self.pulled,
            completed: self.completed,
            failed: self.failed,
            last_pull_at: self.last_pull_at,
            last_submit_at: self.last_submit_at,
        }
    }
}

/// Public view of a bot's counters; what `/bots/:id/stats` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStats {
    pub bot_id: String,
    pub enabled: bool,
    pub pulled: i64,
    pub completed: i64,
    pub failed: i64,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_submit_at: Option<DateTime<Utc>>,
}

/// Which counter a submission bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed,
    Failed,
}
