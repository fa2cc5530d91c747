//! In-memory response cache with TTL expiry, LRU eviction and
//! configuration-aware key derivation.

mod key;
mod store;

pub use key::{CacheKeyBuilder, RequestFingerprint};
pub use store::{CacheEntry, CacheStats, CacheStore};
