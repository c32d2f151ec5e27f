//! Price history sink: append-only, one row per observed change.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::common::PriceHistoryId;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub target_ref: String,
    pub price: Decimal,
    pub currency: String,
    pub available: bool,
    pub observed_at: DateTime<Utc>,
    /// Where the observation came from, e.g. `crawl:jsonld`.
    pub source: String,
}

#[derive(FromRow, Debug, Clone, PartialEq, Serialize)]
pub struct PriceHistoryEntry {
    pub id: PriceHistoryId,
    pub target_ref: String,
    pub price: Decimal,
    pub currency: String,
    pub available: bool,
    pub observed_at: DateTime<Utc>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl PriceHistoryEntry {
    fn from_observation(obs: &PriceObservation, now: DateTime<Utc>) -> Self {
        Self {
            id: PriceHistoryId::new(),
            target_ref: obs.target_ref.clone(),
            price: obs.price,
            currency: obs.currency.clone(),
            available: obs.available,
            observed_at: obs.observed_at,
            source: obs.source.clone(),
            created_at: now,
        }
    }

    /// Same price, currency and availability. Decimal equality ignores scale.
    pub fn same_as(&self, obs: &PriceObservation) -> bool {
        self.price == obs.price && self.currency == obs.currency && self.available == obs.available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(PriceHistoryId),
    Duplicate,
}

#[async_trait]
pub trait PriceHistorySink: Send + Sync {
    /// Append `obs` unless it matches the latest entry for its target.
    /// Concurrent writers for the same target are serialized.
    async fn write_if_changed(&self, obs: &PriceObservation) -> Result<WriteOutcome>;

    async fn latest(&self, target_ref: &str) -> Result<Option<PriceHistoryEntry>>;
}

const ENTRY_COLUMNS: &str =
    "id, target_ref, price, currency, available, observed_at, source, created_at";

pub struct PostgresPriceHistory {
    pool: PgPool,
}

impl PostgresPriceHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceHistorySink for PostgresPriceHistory {
    async fn write_if_changed(&self, obs: &PriceObservation) -> Result<WriteOutcome> {
        let mut tx = self.pool.begin().await?;

        // Held until commit; serializes compare-and-append per target.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&obs.target_ref)
            .execute(&mut *tx)
            .await?;

        let latest = sqlx::query_as::<_, PriceHistoryEntry>(&format!(
            "SELECT {} FROM price_history WHERE target_ref = $1 \
             ORDER BY observed_at DESC, created_at DESC LIMIT 1",
            ENTRY_COLUMNS
        ))
        .bind(&obs.target_ref)
        .fetch_optional(&mut *tx)
        .await?;

        if latest.is_some_and(|entry| entry.same_as(obs)) {
            tx.rollback().await?;
            return Ok(WriteOutcome::Duplicate);
        }

        let id = PriceHistoryId::new();
        sqlx::query(
            r#"
            INSERT INTO price_history (id, target_ref, price, currency, available, observed_at, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&obs.target_ref)
        .bind(obs.price)
        .bind(&obs.currency)
        .bind(obs.available)
        .bind(obs.observed_at)
        .bind(&obs.source)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to append price history for {}", obs.target_ref))?;

        tx.commit().await?;
        Ok(WriteOutcome::Written(id))
    }

    async fn latest(&self, target_ref: &str) -> Result<Option<PriceHistoryEntry>> {
        let entry = sqlx::query_as::<_, PriceHistoryEntry>(&format!(
            "SELECT {} FROM price_history WHERE target_ref = $1 \
             ORDER BY observed_at DESC, created_at DESC LIMIT 1",
            ENTRY_COLUMNS
        ))
        .bind(target_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }
}

/// In-process sink for tests and local runs.
#[derive(Default)]
pub struct InMemoryPriceHistory {
    entries: Mutex<HashMap<String, Vec<PriceHistoryEntry>>>,
}

impl InMemoryPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries for a target in insertion order.
    pub fn entries_for(&self, target_ref: &str) -> Vec<PriceHistoryEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(target_ref).cloned().unwrap_or_default()
    }

    /// Most recent by `observed_at`, then `created_at`; later insertions win ties.
    fn latest_of(history: &[PriceHistoryEntry]) -> Option<&PriceHistoryEntry> {
        history
            .iter()
            .max_by_key(|entry| (entry.observed_at, entry.created_at))
    }
}

#[async_trait]
impl PriceHistorySink for InMemoryPriceHistory {
    async fn write_if_changed(&self, obs: &PriceObservation) -> Result<WriteOutcome> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let history = entries.entry(obs.target_ref.clone()).or_default();

        if Self::latest_of(history).is_some_and(|entry| entry.same_as(obs)) {
            return Ok(WriteOutcome::Duplicate);
        }

        let entry = PriceHistoryEntry::from_observation(obs, Utc::now());
        let id = entry.id;
        history.push(entry);
        Ok(WriteOutcome::Written(id))
    }

    async fn latest(&self, target_ref: &str) -> Result<Option<PriceHistoryEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries
            .get(target_ref)
            .and_then(|history| Self::latest_of(history))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation_at(price: Decimal, observed_at: DateTime<Utc>) -> PriceObservation {
        PriceObservation {
            observed_at,
            ..observation(price, true)
        }
    }

    fn observation(price: Decimal, available: bool) -> PriceObservation {
        PriceObservation {
            target_ref: "https://shop.test/widget".into(),
            price,
            currency: "USD".into(),
            available,
            observed_at: Utc::now(),
            source: "crawl:jsonld".into(),
        }
    }

    #[tokio::test]
    async fn identical_observation_is_a_duplicate() {
        let sink = InMemoryPriceHistory::new();

        let first = sink.write_if_changed(&observation(Decimal::new(9999, 2), true)).await.unwrap();
        assert!(matches!(first, WriteOutcome::Written(_)));

        // 99.9900 and 99.99 are the same price.
        let second = sink
            .write_if_changed(&observation(Decimal::new(999900, 4), true))
            .await
            .unwrap();
        assert_eq!(second, WriteOutcome::Duplicate);
        assert_eq!(sink.entries_for("https://shop.test/widget").len(), 1);
    }

    #[tokio::test]
    async fn change_in_price_or_availability_is_written() {
        let sink = InMemoryPriceHistory::new();
        sink.write_if_changed(&observation(Decimal::new(9999, 2), true)).await.unwrap();
        sink.write_if_changed(&observation(Decimal::new(8999, 2), true)).await.unwrap();
        sink.write_if_changed(&observation(Decimal::new(8999, 2), false)).await.unwrap();
        // Back to an earlier price is still a change against the latest row.
        sink.write_if_changed(&observation(Decimal::new(9999, 2), true)).await.unwrap();

        assert_eq!(sink.entries_for("https://shop.test/widget").len(), 4);
        let latest = sink.latest("https://shop.test/widget").await.unwrap().unwrap();
        assert_eq!(latest.price, Decimal::new(9999, 2));
        assert!(latest.available);
    }

    #[tokio::test]
    async fn late_arriving_observation_compares_against_newest_observed() {
        let sink = InMemoryPriceHistory::new();
        let now = Utc::now();

        sink.write_if_changed(&observation_at(Decimal::new(9999, 2), now)).await.unwrap();
        // An older reading at another price arrives after the newer one.
        let stale = sink
            .write_if_changed(&observation_at(Decimal::new(8999, 2), now - chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(matches!(stale, WriteOutcome::Written(_)));

        // The newest observation is still 99.99, so repeating it is a duplicate.
        let repeat = sink
            .write_if_changed(&observation_at(Decimal::new(9999, 2), now + chrono::Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(repeat, WriteOutcome::Duplicate);

        let latest = sink.latest("https://shop.test/widget").await.unwrap().unwrap();
        assert_eq!(latest.price, Decimal::new(9999, 2));
        assert_eq!(latest.observed_at, now);
    }
}
