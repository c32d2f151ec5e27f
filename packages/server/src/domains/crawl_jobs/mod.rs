//! Crawl jobs: the lease state machine, its store and the bot-facing actions.

pub mod actions;
pub mod models;
pub mod store;
