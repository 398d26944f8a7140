use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation failed: {0}")]
    Operation(String),
}

/// Key/value cache with glob-style (`*`) pattern removal.
///
/// Every `remove` and `remove_pattern` advances a store-wide generation before
/// deleting. Fills that read the generation before loading and write through
/// `set_if_generation` can therefore never resurrect a value that an
/// invalidation already cleared.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), CacheError>>;

    fn generation(&self) -> BoxFuture<'_, Result<u64, CacheError>>;

    /// Stores only while the generation still equals `generation`; the check
    /// and the write are atomic. Returns whether the value was stored.
    fn set_if_generation(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        generation: u64,
    ) -> BoxFuture<'_, Result<bool, CacheError>>;

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Returns how many keys were removed.
    fn remove_pattern(&self, pattern: &str) -> BoxFuture<'_, Result<u64, CacheError>>;
}
