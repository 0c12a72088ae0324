use std::{
    error, fmt,
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ExpiringCache, sources::TokenFetcher, AccessToken, AccessTokenRef, CacheError,
    CacheKey, CacheKeyRef, ConfigError, TokenError,
};

/// The expire buffer used when none is configured
pub const DEFAULT_EXPIRE_BUFFER_SECS: u64 = 300;

type Outcome = Result<AccessToken, TokenError>;

/// A handle on the fetch currently in progress
#[derive(Clone)]
struct Inflight {
    generation: u64,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl Inflight {
    async fn wait(mut self) -> Outcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(outcome) => outcome.clone(),
                None => Err(TokenError::Abandoned),
            },
            Err(_) => Err(TokenError::Abandoned),
        }
    }
}

struct State {
    inflight: Option<Inflight>,
    next_generation: u64,
}

struct Inner {
    cache: Arc<dyn ExpiringCache>,
    cache_key: CacheKey,
    fetcher: Arc<dyn TokenFetcher>,
    expire_buffer: u64,
    state: Mutex<State>,
    /// The most recent fetch that produced a token
    latest: StdMutex<Option<Refreshed>>,
}

/// A token obtained from the fetcher, independent of whether caching it worked
#[derive(Clone, Debug)]
struct Refreshed {
    generation: u64,
    token: AccessToken,
}

#[derive(Clone, Debug)]
enum Mode {
    /// Serve from the cache when possible
    Cached,
    /// Ignore the cache, unless a fetch newer than `seen` has since completed
    Forced { seen: u64 },
    /// Like `Forced`, but any live cached token other than `rejected` is
    /// served as is
    Replace { seen: u64, rejected: AccessToken },
}

/// Caches an access token and refreshes it at most once at a time
///
/// However many tasks ask for a token while it is missing or being refreshed,
/// only one request reaches the [`TokenFetcher`]. Everyone else waits for that
/// request and receives its outcome, success or failure alike.
///
/// The in-flight fetch runs on its own task. A caller that stops waiting,
/// whether by cancelling or by dropping the future, does not stop the fetch
/// for anyone else, and the token is still cached when it arrives.
///
/// Handles are cheap to clone and share the same state.
///
/// ```
/// use tokenward::{cache::MemoryCache, sources::ConstTokenFetcher, TokenManager};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() {
/// let manager = TokenManager::builder()
///     .cache(MemoryCache::new())
///     .cache_key("miniprogram:access_token:wx123")
///     .fetcher(ConstTokenFetcher::new("my-token"))
///     .build()
///     .unwrap();
///
/// let token = manager.get_token().await.unwrap();
/// assert_eq!(token.as_str(), "my-token");
/// # }
/// ```
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Starts building a new token manager
    pub fn builder() -> TokenManagerBuilder {
        TokenManagerBuilder::default()
    }

    /// The key under which the token is cached
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.inner.cache_key
    }

    /// The margin subtracted from a token's reported lifetime before caching it
    pub fn expire_buffer(&self) -> Duration {
        Duration::from_secs(self.inner.expire_buffer)
    }

    /// Gets the current token, fetching a new one only if none is cached
    pub async fn get_token(&self) -> Result<AccessToken, TokenError> {
        if let Some(token) = self.inner.cached_token().await {
            tracing::trace!(cache_key = %self.inner.cache_key, "access token served from cache");
            return Ok(token);
        }

        self.acquire(Mode::Cached).await
    }

    /// Gets a token that is newer than the one currently cached
    ///
    /// Use this when the upstream API has rejected the current token. If
    /// another caller's refresh finishes while this call is waiting for its
    /// turn, that token is returned instead of fetching yet again.
    pub async fn refresh_token(&self) -> Result<AccessToken, TokenError> {
        let seen = self.inner.latest_generation();
        self.acquire(Mode::Forced { seen }).await
    }

    /// Replaces `rejected` with a newer token, unless that already happened
    ///
    /// Any number of callers holding the same rejected token cause at most one
    /// fetch: whoever comes after it sees the replacement in the cache, or
    /// joins the fetch still in progress.
    pub async fn refresh_token_if_current(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<AccessToken, TokenError> {
        let seen = self.inner.latest_generation();
        self.acquire(Mode::Replace {
            seen,
            rejected: rejected.to_owned(),
        })
        .await
    }

    /// Like [`get_token()`][Self::get_token()], but gives up with
    /// [`TokenError::Cancelled`] once `cancel` fires
    pub async fn get_token_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, TokenError> {
        with_cancellation(cancel, self.get_token()).await
    }

    /// Like [`refresh_token()`][Self::refresh_token()], but gives up with
    /// [`TokenError::Cancelled`] once `cancel` fires
    pub async fn refresh_token_with_cancellation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, TokenError> {
        with_cancellation(cancel, self.refresh_token()).await
    }

    /// Removes the cached token so that the next request fetches a new one
    pub async fn invalidate(&self) -> Result<(), CacheError> {
        tracing::debug!(cache_key = %self.inner.cache_key, "invalidating cached access token");
        self.inner.cache.delete(self.inner.cache_key.as_str()).await
    }

    async fn acquire(&self, mode: Mode) -> Outcome {
        let inflight = {
            let mut state = self.inner.state.lock().await;

            match &mode {
                Mode::Cached => {
                    if let Some(token) = self.inner.cached_token().await {
                        return Ok(token);
                    }
                }
                Mode::Forced { seen } => {
                    if let Some(token) = self.inner.refreshed_since(*seen, None) {
                        tracing::debug!(
                            cache_key = %self.inner.cache_key,
                            "access token was refreshed by a concurrent caller"
                        );
                        return Ok(token);
                    }
                }
                Mode::Replace { seen, rejected } => {
                    if let Some(token) = self.inner.refreshed_since(*seen, Some(rejected)) {
                        tracing::debug!(
                            cache_key = %self.inner.cache_key,
                            "rejected access token was replaced by a concurrent caller"
                        );
                        return Ok(token);
                    }
                    if let Some(token) = self.inner.cached_token().await {
                        if token.as_str() != rejected.as_str() {
                            tracing::debug!(
                                cache_key = %self.inner.cache_key,
                                "cache already holds a replacement for the rejected access token"
                            );
                            return Ok(token);
                        }
                    }
                }
            }

            if let Some(inflight) = &state.inflight {
                tracing::debug!(
                    cache_key = %self.inner.cache_key,
                    generation = inflight.generation,
                    "joining in-flight token fetch"
                );
                inflight.clone()
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;

                let (tx, rx) = watch::channel(None);
                let inflight = Inflight {
                    generation,
                    outcome: rx,
                };
                state.inflight = Some(inflight.clone());

                let force = !matches!(mode, Mode::Cached);
                tokio::spawn(Arc::clone(&self.inner).run_fetch(generation, force, tx));

                inflight
            }
        };

        inflight.wait().await
    }
}

impl Inner {
    fn latest(&self) -> std::sync::MutexGuard<'_, Option<Refreshed>> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn latest_generation(&self) -> u64 {
        self.latest().as_ref().map_or(0, |latest| latest.generation)
    }

    /// The token from a fetch that completed after generation `seen`, if it
    /// is not the `rejected` one
    fn refreshed_since(&self, seen: u64, rejected: Option<&AccessToken>) -> Option<AccessToken> {
        self.latest()
            .as_ref()
            .filter(|latest| latest.generation > seen)
            .filter(|latest| rejected.map_or(true, |r| r.as_str() != latest.token.as_str()))
            .map(|latest| latest.token.clone())
    }

    fn record_refresh(&self, generation: u64, token: &AccessToken) {
        let mut latest = self.latest();
        if latest.as_ref().map_or(true, |l| l.generation < generation) {
            *latest = Some(Refreshed {
                generation,
                token: token.clone(),
            });
        }
    }

    async fn cached_token(&self) -> Option<AccessToken> {
        self.cache
            .get(self.cache_key.as_str())
            .await
            .map(AccessToken::new)
    }

    async fn run_fetch(
        self: Arc<Self>,
        generation: u64,
        force: bool,
        tx: watch::Sender<Option<Outcome>>,
    ) {
        let outcome = match tokio::spawn(Arc::clone(&self).fetch_and_store(generation, force)).await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(
                    cache_key = %self.cache_key,
                    generation,
                    error = (&error as &dyn error::Error),
                    "token fetch did not run to completion"
                );
                Err(TokenError::Abandoned)
            }
        };

        tx.send_replace(Some(outcome));

        let mut state = self.state.lock().await;
        if state.inflight.as_ref().map(|i| i.generation) == Some(generation) {
            state.inflight = None;
        }
    }

    async fn fetch_and_store(self: Arc<Self>, generation: u64, force: bool) -> Outcome {
        if !force {
            if let Some(token) = self.cached_token().await {
                tracing::debug!(
                    cache_key = %self.cache_key,
                    "access token appeared in cache before fetching"
                );
                return Ok(token);
            }
        }

        tracing::debug!(cache_key = %self.cache_key, generation, force, "fetching new access token");

        let fetched = match self.fetcher.fetch_token().await {
            Ok(fetched) => fetched,
            Err(error) => {
                tracing::warn!(
                    cache_key = %self.cache_key,
                    error = (&*error as &dyn error::Error),
                    "unable to fetch access token"
                );
                return Err(TokenError::fetch(error));
            }
        };

        if fetched.access_token.as_str().is_empty() {
            tracing::warn!(cache_key = %self.cache_key, "token fetcher returned an empty token");
            return Err(TokenError::EmptyToken);
        }

        let ttl = cache_ttl(fetched.expires_in, self.expire_buffer);
        if let Err(error) = self
            .cache
            .set(self.cache_key.as_str(), fetched.access_token.as_str(), ttl)
            .await
        {
            tracing::warn!(
                cache_key = %self.cache_key,
                error = (&error as &dyn error::Error),
                "unable to cache access token"
            );
        }

        self.record_refresh(generation, &fetched.access_token);

        tracing::info!(
            cache_key = %self.cache_key,
            expires_in = fetched.expires_in,
            ttl = ttl.as_secs(),
            "obtained new access token"
        );

        Ok(fetched.access_token)
    }
}

/// How long a token with the given reported lifetime may be served from cache
///
/// Never less than one second, since a zero TTL would be stored as "never
/// expires".
fn cache_ttl(expires_in: u64, expire_buffer: u64) -> Duration {
    Duration::from_secs(expires_in.saturating_sub(expire_buffer).max(1))
}

async fn with_cancellation<F>(cancel: &CancellationToken, request: F) -> Outcome
where
    F: Future<Output = Outcome>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("stopped waiting for access token");
            Err(TokenError::Cancelled)
        }
        outcome = request => outcome,
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("cache_key", &self.inner.cache_key)
            .field("expire_buffer", &self.inner.expire_buffer)
            .field("latest_generation", &self.inner.latest_generation())
            .finish_non_exhaustive()
    }
}

/// Configures and constructs a [`TokenManager`]
///
/// A cache, a non-empty cache key, and a fetcher are required. The expire
/// buffer defaults to [`DEFAULT_EXPIRE_BUFFER_SECS`].
#[derive(Default)]
pub struct TokenManagerBuilder {
    cache: Option<Arc<dyn ExpiringCache>>,
    cache_key: Option<CacheKey>,
    fetcher: Option<Arc<dyn TokenFetcher>>,
    expire_buffer_secs: u64,
}

impl TokenManagerBuilder {
    /// Sets the cache in which tokens are stored
    ///
    /// The cache may be shared with other managers or other processes.
    pub fn cache<C>(mut self, cache: C) -> Self
    where
        C: ExpiringCache + 'static,
    {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Sets the key under which the token is cached
    pub fn cache_key(mut self, cache_key: impl Into<CacheKey>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    /// Sets the source of fresh tokens
    pub fn fetcher<F>(mut self, fetcher: F) -> Self
    where
        F: TokenFetcher + 'static,
    {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Sets how many seconds before its reported expiry a token stops being
    /// served from cache
    ///
    /// Zero selects the default of [`DEFAULT_EXPIRE_BUFFER_SECS`].
    pub fn expire_buffer_secs(mut self, expire_buffer_secs: u64) -> Self {
        self.expire_buffer_secs = expire_buffer_secs;
        self
    }

    /// Builds the token manager
    ///
    /// # Errors
    ///
    /// Returns an error if the cache, cache key, or fetcher is missing.
    pub fn build(self) -> Result<TokenManager, ConfigError> {
        let cache = self.cache.ok_or(ConfigError::MissingCache)?;
        let cache_key = self
            .cache_key
            .filter(|key| !key.as_str().is_empty())
            .ok_or(ConfigError::MissingCacheKey)?;
        let fetcher = self.fetcher.ok_or(ConfigError::MissingFetcher)?;

        let expire_buffer = if self.expire_buffer_secs == 0 {
            DEFAULT_EXPIRE_BUFFER_SECS
        } else {
            self.expire_buffer_secs
        };

        Ok(TokenManager {
            inner: Arc::new(Inner {
                cache,
                cache_key,
                fetcher,
                expire_buffer,
                state: Mutex::new(State {
                    inflight: None,
                    next_generation: 1,
                }),
                latest: StdMutex::new(None),
            }),
        })
    }
}

impl fmt::Debug for TokenManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManagerBuilder")
            .field("has_cache", &self.cache.is_some())
            .field("cache_key", &self.cache_key)
            .field("has_fetcher", &self.fetcher.is_some())
            .field("expire_buffer_secs", &self.expire_buffer_secs)
            .finish()
    }
}
