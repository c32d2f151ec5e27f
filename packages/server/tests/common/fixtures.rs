//! Request and payload builders shared by the integration tests.

use crawl_core::domains::crawl_jobs::models::{ExtractionSource, MlReading, StructuredPayload};
use rust_decimal::Decimal;

/// `cents` as a two-decimal price, e.g. `price(9999)` is 99.99.
pub fn price(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn ml_payload(confidence: f64) -> StructuredPayload {
    StructuredPayload {
        sources: vec![ExtractionSource::Ml(MlReading {
            price: Some(price(1000)),
            currency: Some("USD".to_string()),
            confidence,
        })],
        failure: None,
    }
}
