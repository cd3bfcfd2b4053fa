//! Cache partitions for intercepted responses and queued submissions.
//!
//! - Named partitions of (request, response) pairs, kept in insertion order
//! - Oldest-first trimming to a per-partition bound
//! - Wholesale eviction of partitions from a previous version
//! - SQLite persistence so the cache survives restarts

mod storage;
mod store;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use store::CacheStore;
pub use traits::{Fetched, ResponseSource};
