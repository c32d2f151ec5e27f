// Business domains
pub mod auto_record;
pub mod bots;
pub mod crawl_jobs;
pub mod reset;
