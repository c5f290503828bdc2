//! In-memory caches

pub mod byte_lru;
pub mod resource;

pub use byte_lru::{ByteLru, CacheStats};
pub use resource::{ResourceCache, SharedImage};
