//! Expiring key-value caches for credential material

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::CacheError;

mod memory;

pub use memory::MemoryCache;

/// A string-to-string cache with optional per-entry expiry
///
/// Implementations may be purely local, like [`MemoryCache`], or shared
/// between processes, such as a Redis-backed cache. Callers must not assume
/// that they are the only writer.
#[async_trait]
pub trait ExpiringCache: Send + Sync {
    /// Looks up a live value
    ///
    /// Returns `None` if the key is absent or its entry has expired.
    async fn get(&self, key: &str) -> Option<String>;

    /// Stores a value, replacing any existing entry for `key`
    ///
    /// A `ttl` of [`Duration::ZERO`] stores a value that never expires.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Removes a value
    ///
    /// Removing a key that is not present succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait]
impl<C: ExpiringCache + ?Sized> ExpiringCache for Arc<C> {
    async fn get(&self, key: &str) -> Option<String> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }
}
