//! Deferred reset: rules, their store, the scheduler and its loop.

pub mod models;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use models::{ResetRule, RuleSet, SelectionType};
pub use scheduler::{DeferredResetScheduler, DueReport, RulePassReport};
pub use store::{InMemoryResetRuleStore, PostgresResetRuleStore, ResetRuleStore};
pub use worker::ResetLoop;
