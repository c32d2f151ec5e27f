// Crawl Coordinator - API Core
//
// This crate provides the job distribution engine for a fleet of price
// crawling bots: leased pull/submit over HTTP, deferred resets of completed
// jobs, and asynchronous recording of results into price history.
//
// Business logic lives per-domain in domains/*; shared infrastructure in kernel/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
