//! Response caching keyed by request fingerprint.
//!
//! Identical requests share one computation while it runs and one stored
//! response until its TTL passes.

pub mod config;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigError};
pub use store::FingerprintCache;
pub use types::{CacheEntry, CacheLookup, CacheStats};
