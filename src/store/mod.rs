pub mod memory;
pub mod redis;

pub use self::memory::InMemoryDecisionStore;
pub use self::redis::RedisDecisionStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{StoreConfig, StoreType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared substrate for security decisions: blocklist, rate counters and
/// keyed data, all with TTL semantics.
///
/// The in-memory variant serves a single process; the distributed variant
/// makes a block decided on one instance enforceable across a fleet.
/// Implementations must provide linearizable per-key semantics for
/// `block`/`is_blocked` and atomic increments for counters.
pub trait DecisionStore: Send + Sync {
    /// True iff a non-expired block exists for the key. Expired entries are
    /// evicted as a side effect.
    fn is_blocked(&self, key: &str) -> StoreResult<bool>;

    /// Upsert a block. `None` duration means permanent.
    fn block(&self, key: &str, reason: &str, duration: Option<Duration>) -> StoreResult<()>;

    fn unblock(&self, key: &str) -> StoreResult<()>;

    /// Atomic increment-or-create: absent or expired keys restart at
    /// `(1, now + window)`, otherwise the count grows without touching the
    /// expiry. Returns the post-increment value.
    fn increment_counter(&self, key: &str, window: Duration) -> StoreResult<u64>;

    /// Current count without incrementing; 0 if absent or expired.
    fn get_counter(&self, key: &str) -> StoreResult<u64>;

    /// Delete a counter outright (used to reset sequential-access tracking).
    fn clear_counter(&self, key: &str) -> StoreResult<()>;

    /// Store a string value with an optional TTL.
    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Snapshot of all non-expired blocks, key to reason.
    fn get_all_blocked(&self) -> StoreResult<HashMap<String, String>>;
}

/// Build the store variant selected by configuration.
pub fn from_config(config: &StoreConfig) -> StoreResult<Arc<dyn DecisionStore>> {
    match config.store_type {
        StoreType::InMemory => Ok(Arc::new(InMemoryDecisionStore::new())),
        StoreType::Distributed => Ok(Arc::new(RedisDecisionStore::new(&config.distributed_url)?)),
    }
}
