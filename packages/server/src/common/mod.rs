// Common types shared across the coordinator

pub mod entity_ids;
pub mod errors;
pub mod id;

pub use entity_ids::*;
pub use errors::{AuthenticationError, CoordinatorError, LeaseConflict, TransitionError};
pub use id::Id;
