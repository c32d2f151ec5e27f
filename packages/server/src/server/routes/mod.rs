// HTTP routes
pub mod bots;
pub mod health;
pub mod pull;
pub mod submit;

pub use bots::*;
pub use health::*;
pub use pull::*;
pub use submit::*;
