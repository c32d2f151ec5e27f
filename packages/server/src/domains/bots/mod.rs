//! Bot registry and authentication.

pub mod authenticator;
pub mod credentials;
pub mod models;
pub mod registry;

pub use authenticator::{authenticate, verify_bot};
pub use credentials::{credential_matches, hash_credential};
pub use models::{BotIdentity, BotStats, SubmitOutcome};
pub use registry::{BotRegistry, InMemoryBotRegistry, PostgresBotRegistry};
