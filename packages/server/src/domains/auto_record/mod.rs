//! Promotion of eligible crawl results into price history.

pub mod pipeline;
pub mod policy;
pub mod sink;
pub mod worker;

pub use pipeline::{AutoRecordPipeline, BatchReport, ProcessOutcome};
pub use policy::{Eligibility, EligibilityPolicy};
pub use sink::{
    InMemoryPriceHistory, PostgresPriceHistory, PriceHistoryEntry, PriceHistorySink,
    PriceObservation, WriteOutcome,
};
pub use worker::AutoRecordWorker;
