// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Naming convention: Base* for trait names (e.g., BaseClock)

use chrono::{DateTime, Utc};

// =============================================================================
// Clock Trait (Infrastructure - wall-clock time)
// =============================================================================

/// Source of "now" for every lease and scheduling decision.
///
/// Lease staleness is computed against this clock rather than the database
/// clock so services and stores agree on a single instant per operation.
pub trait BaseClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
