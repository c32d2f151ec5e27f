//! Crawl job actions - entry points called from the HTTP routes.

pub mod enqueue;
pub mod pull;
pub mod submit;

pub use enqueue::{enqueue_job, enqueue_jobs};
pub use pull::{LeasedJob, PullRequest, PullResponse, PullService};
pub use submit::{Submission, SubmitRequest, SubmitResponse, SubmitService};
