//! Cache substrate: backends, key scheme and the best-effort cache service.

pub mod backend;
pub mod keys;
pub mod local_backend;
pub mod redis_backend;
pub mod service;

pub use backend::{CacheBackend, CacheError};
pub use keys::CacheKeys;
pub use local_backend::LocalBackend;
pub use redis_backend::RedisBackend;
pub use service::CacheService;
