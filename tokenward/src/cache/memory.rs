//! An in-memory expiring cache

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokenward_clock::{Clock, System};
use tokio_util::sync::CancellationToken;

use super::ExpiringCache;
use crate::CacheError;

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    #[inline]
    fn is_live_at(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

struct Inner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Box<dyn Clock + Send + Sync>,
}

/// A process-local expiring cache
///
/// Expired entries read as misses but stay in memory until they are
/// overwritten, deleted, or swept by [`cleanup()`][Self::cleanup()].
///
/// Clones share the same underlying storage.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Constructs an empty cache using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }

    /// Constructs an empty cache that checks expiry against `clock`
    ///
    /// Useful for testing purposes
    pub fn with_clock<C>(clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                clock: Box::new(clock),
            }),
        }
    }

    /// Removes every entry that has expired as of now
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = self.inner.clock.now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live_at(now));
        let removed = before - entries.len();

        tracing::trace!(removed, remaining = entries.len(), "swept expired cache entries");
        removed
    }

    /// The number of stored entries, including expired entries not yet swept
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Spawns a task that calls [`cleanup()`][Self::cleanup()] every `period`
    ///
    /// The task stops once the returned token is cancelled or every other
    /// handle to this cache has been dropped. In the latter case the task
    /// cancels the token itself on its way out.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn spawn_cleanup(&self, period: Duration) -> CancellationToken {
        assert!(!period.is_zero(), "cleanup period must be non-zero");

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = timer.tick() => {}
                }

                match weak.upgrade() {
                    Some(inner) => {
                        MemoryCache { inner }.cleanup();
                    }
                    None => break,
                }
            }

            stop.cancel();
            tracing::debug!("cache cleanup task stopped");
        });

        shutdown
    }

    // A panic while holding the lock cannot leave a half-written entry behind,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[async_trait]
impl ExpiringCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = self.inner.clock.now();
        self.read()
            .get(key)
            .filter(|entry| entry.is_live_at(now))
            .map(|entry| entry.value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        // A deadline past what `Instant` can represent is as good as never
        let expires_at = if ttl.is_zero() {
            None
        } else {
            self.inner.clock.now().checked_add(ttl)
        };

        self.write().insert(
            key.to_owned(),
            CacheEntry {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokenward_clock::TestClock;

    use super::*;

    #[tokio::test]
    async fn returns_value_that_has_not_expired() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("absent").await, None);
    }

    #[tokio::test]
    async fn short_ttl_expires_in_real_time() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let clock = TestClock::new();
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("k", "v", Duration::ZERO).await.unwrap();

        clock.advance_secs(10 * 365 * 24 * 60 * 60);

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.cleanup(), 0);
    }

    #[tokio::test]
    async fn entry_expires_exactly_at_its_deadline() {
        let clock = TestClock::new();
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("k", "v", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_millis(9_999));
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_entries_stay_stored_until_cleanup() {
        let clock = TestClock::new();
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("short", "a", Duration::from_secs(1)).await.unwrap();
        cache.set("long", "b", Duration::from_secs(100)).await.unwrap();
        cache.set("forever", "c", Duration::ZERO).await.unwrap();

        clock.advance_secs(5);

        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("long").await.as_deref(), Some("b"));
        assert_eq!(cache.get("forever").await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn set_overwrites_value_and_expiry() {
        let clock = TestClock::new();
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("k", "old", Duration::from_secs(1)).await.unwrap();
        cache.set("k", "new", Duration::ZERO).await.unwrap();

        clock.advance_secs(5);

        assert_eq!(cache.get("k").await.as_deref(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::ZERO).await.unwrap();

        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        cache.delete("never-set").await.unwrap();

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        cache.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(other.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cleanup_is_safe_alongside_reads_and_writes() {
        let cache = MemoryCache::new();
        let mut tasks = Vec::new();

        for i in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..100 {
                    let key = format!("{}-{}", i, j % 10);
                    cache.set(&key, "v", Duration::from_millis(1)).await.unwrap();
                    let _ = cache.get(&key).await;
                    if j % 7 == 0 {
                        cache.cleanup();
                    }
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.cleanup();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn spawned_cleanup_sweeps_until_cancelled() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(5)).await.unwrap();

        let shutdown = cache.spawn_cleanup(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn spawned_cleanup_stops_when_the_cache_is_dropped() {
        let cache = MemoryCache::new();
        let shutdown = cache.spawn_cleanup(Duration::from_millis(10));

        drop(cache);

        tokio::time::timeout(Duration::from_millis(500), shutdown.cancelled())
            .await
            .expect("cleanup task should stop once the cache is gone");
    }

    #[tokio::test]
    #[should_panic(expected = "cleanup period must be non-zero")]
    async fn zero_cleanup_period_is_rejected() {
        let _ = MemoryCache::new().spawn_cleanup(Duration::ZERO);
    }

    #[tokio::test]
    async fn ttl_beyond_the_representable_range_never_expires() {
        let clock = TestClock::new();
        let cache = MemoryCache::with_clock(clock.clone());
        cache.set("k", "v", Duration::MAX).await.unwrap();

        clock.advance_secs(10 * 365 * 24 * 60 * 60);

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.cleanup(), 0);
    }
}
