use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::ResetRule;
use crate::common::RuleId;

#[async_trait]
pub trait ResetRuleStore: Send + Sync {
    /// Enabled rules, oldest first.
    async fn enabled_rules(&self) -> Result<Vec<ResetRule>>;

    async fn save_rule(&self, rule: &ResetRule) -> Result<()>;

    async fn mark_rule_run(&self, id: RuleId, at: DateTime<Utc>) -> Result<()>;
}

pub struct PostgresResetRuleStore {
    pool: PgPool,
}

impl PostgresResetRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResetRuleStore for PostgresResetRuleStore {
    async fn enabled_rules(&self) -> Result<Vec<ResetRule>> {
        let rules = sqlx::query_as::<_, ResetRule>(
            r#"
            SELECT id, name, selection_type, selector, frequency_seconds, enabled, last_run_at, created_at
            FROM reset_rules
            WHERE enabled
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    async fn save_rule(&self, rule: &ResetRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reset_rules (id, name, selection_type, selector, frequency_seconds, enabled, last_run_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                selection_type = EXCLUDED.selection_type,
                selector = EXCLUDED.selector,
                frequency_seconds = EXCLUDED.frequency_seconds,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.selection_type)
        .bind(&rule.selector)
        .bind(rule.frequency_seconds)
        .bind(rule.enabled)
        .bind(rule.last_run_at)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save reset rule {}", rule.name))?;

        Ok(())
    }

    async fn mark_rule_run(&self, id: RuleId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE reset_rules SET last_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryResetRuleStore {
    rules: Mutex<Vec<ResetRule>>,
}

impl InMemoryResetRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: RuleId) -> Option<ResetRule> {
        let rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        rules.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl ResetRuleStore for InMemoryResetRuleStore {
    async fn enabled_rules(&self) -> Result<Vec<ResetRule>> {
        let rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        let mut enabled: Vec<ResetRule> = rules.iter().filter(|r| r.enabled).cloned().collect();
        enabled.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(enabled)
    }

    async fn save_rule(&self, rule: &ResetRule) -> Result<()> {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                let last_run_at = existing.last_run_at;
                *existing = rule.clone();
                existing.last_run_at = last_run_at;
            }
            None => rules.push(rule.clone()),
        }
        Ok(())
    }

    async fn mark_rule_run(&self, id: RuleId, at: DateTime<Utc>) -> Result<()> {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rule) = rules.iter_mut().find(|r| r.id == id) {
            rule.last_run_at = Some(at);
        }
        Ok(())
    }
}
