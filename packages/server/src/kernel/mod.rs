//! Kernel module - server infrastructure and dependencies.

pub mod cache;
pub mod clock;
pub mod deps;
pub mod service_host;
pub mod test_dependencies;
pub mod traits;

pub use clock::SystemClock;
pub use deps::ServerDeps;
pub use service_host::{spawn_signal_listener, Service, ServiceHost};
pub use test_dependencies::{FailingCacheBackend, FlakyPriceHistory, ManualClock, TestDependencies};
pub use traits::*;
