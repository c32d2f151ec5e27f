use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{BotIdentity, SubmitOutcome};

const BOT_COLUMNS: &str = "bot_id, credential_hash, enabled, max_jobs_per_pull, custom_lock_ttl_seconds, \
     rate_limit_per_minute, allowed_target_filter, pulled, completed, failed, last_pull_at, last_submit_at, created_at";

#[async_trait]
pub trait BotRegistry: Send + Sync {
    async fn find_bot(&self, bot_id: &str) -> Result<Option<BotIdentity>>;

    /// Create or replace a bot's configuration. Counters are preserved on update.
    async fn save_bot(&self, bot: &BotIdentity) -> Result<()>;

    /// Add `leased` to `pulled` and stamp `last_pull_at`.
    async fn record_pull(&self, bot_id: &str, leased: i64, at: DateTime<Utc>) -> Result<()>;

    async fn record_submit(&self, bot_id: &str, outcome: SubmitOutcome, at: DateTime<Utc>) -> Result<()>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

pub struct PostgresBotRegistry {
    pool: PgPool,
}

impl PostgresBotRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BotRegistry for PostgresBotRegistry {
    async fn find_bot(&self, bot_id: &str) -> Result<Option<BotIdentity>> {
        let bot = sqlx::query_as::<_, BotIdentity>(&format!(
            "SELECT {} FROM crawl_bots WHERE bot_id = $1",
            BOT_COLUMNS
        ))
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(bot)
    }

    async fn save_bot(&self, bot: &BotIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_bots (
                bot_id, credential_hash, enabled, max_jobs_per_pull, custom_lock_ttl_seconds,
                rate_limit_per_minute, allowed_target_filter, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (bot_id) DO UPDATE SET
                credential_hash = EXCLUDED.credential_hash,
                enabled = EXCLUDED.enabled,
                max_jobs_per_pull = EXCLUDED.max_jobs_per_pull,
                custom_lock_ttl_seconds = EXCLUDED.custom_lock_ttl_seconds,
                rate_limit_per_minute = EXCLUDED.rate_limit_per_minute,
                allowed_target_filter = EXCLUDED.allowed_target_filter
            "#,
        )
        .bind(&bot.bot_id)
        .bind(&bot.credential_hash)
        .bind(bot.enabled)
        .bind(bot.max_jobs_per_pull)
        .bind(bot.custom_lock_ttl_seconds)
        .bind(bot.rate_limit_per_minute)
        .bind(&bot.allowed_target_filter)
        .bind(bot.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save bot {}", bot.bot_id))?;

        Ok(())
    }

    async fn record_pull(&self, bot_id: &str, leased: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE crawl_bots SET pulled = pulled + $2, last_pull_at = $3 WHERE bot_id = $1")
            .bind(bot_id)
            .bind(leased)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_submit(&self, bot_id: &str, outcome: SubmitOutcome, at: DateTime<Utc>) -> Result<()> {
        let sql = match outcome {
            SubmitOutcome::Completed => {
                "UPDATE crawl_bots SET completed = completed + 1, last_submit_at = $2 WHERE bot_id = $1"
            }
            SubmitOutcome::Failed => {
                "UPDATE crawl_bots SET failed = failed + 1, last_submit_at = $2 WHERE bot_id = $1"
            }
        };

        sqlx::query(sql).bind(bot_id).bind(at).execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryBotRegistry {
    bots: Mutex<HashMap<String, BotIdentity>>,
}

impl InMemoryBotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bot<T>(&self, bot_id: &str, f: impl FnOnce(&mut BotIdentity) -> T) -> Option<T> {
        let mut bots = self.bots.lock().unwrap_or_else(|p| p.into_inner());
        bots.get_mut(bot_id).map(f)
    }
}

#[async_trait]
impl BotRegistry for InMemoryBotRegistry {
    async fn find_bot(&self, bot_id: &str) -> Result<Option<BotIdentity>> {
        Ok(self.with_bot(bot_id, |bot| bot.clone()))
    }

    async fn save_bot(&self, bot: &BotIdentity) -> Result<()> {
        let mut bots = self.bots.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = bot.clone();
        if let Some(existing) = bots.get(&bot.bot_id) {
            next.pulled = existing.pulled;
            next.completed = existing.completed;
            next.failed = existing.failed;
            next.last_pull_at = existing.last_pull_at;
            next.last_submit_at = existing.last_submit_at;
            next.created_at = existing.created_at;
        }
        bots.insert(next.bot_id.clone(), next);
        Ok(())
    }

    async fn record_pull(&self, bot_id: &str, leased: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_bot(bot_id, |bot| {
            bot.pulled += leased;
            bot.last_pull_at = Some(at);
        });
        Ok(())
    }

    async fn record_submit(&self, bot_id: &str, outcome: SubmitOutcome, at: DateTime<Utc>) -> Result<()> {
        self.with_bot(bot_id, |bot| {
            match outcome {
                SubmitOutcome::Completed => bot.completed += 1,
                SubmitOutcome::Failed => bot.failed += 1,
            }
            bot.last_submit_at = Some(at);
        });
        Ok(())
    }
}
