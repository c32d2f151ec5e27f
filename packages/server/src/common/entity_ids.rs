//! Typed ID definitions for the coordinator's entities.

pub use super::id::Id;

/// Marker type for crawl jobs.
pub struct CrawlJobEntity;

/// Marker type for crawl results.
pub struct CrawlResultEntity;

/// Marker type for reset rules.
pub struct ResetRuleEntity;

/// Marker type for price-history rows.
pub struct PriceHistoryEntity;

pub type JobId = Id<CrawlJobEntity>;
pub type ResultId = Id<CrawlResultEntity>;
pub type RuleId = Id<ResetRuleEntity>;
pub type PriceHistoryId = Id<PriceHistoryEntity>;
