//! Common errors

use std::{error, sync::Arc};

use thiserror::Error;

/// A boxed error as returned by token fetchers and cache backends
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// A token manager could not be constructed because a required part is missing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No cache was provided
    #[error("a cache is required")]
    MissingCache,
    /// No cache key was provided, or the provided key was empty
    #[error("a non-empty cache key is required")]
    MissingCacheKey,
    /// No token fetcher was provided
    #[error("a token fetcher is required")]
    MissingFetcher,
}

/// A cache backend failed to store or remove a value
#[derive(Debug, Error)]
pub enum CacheError {
    /// The underlying storage reported an error
    #[error("cache backend failed")]
    Backend(#[source] BoxError),
}

impl CacheError {
    /// Wraps an arbitrary storage error
    pub fn backend(error: impl Into<BoxError>) -> Self {
        Self::Backend(error.into())
    }
}

/// An access token could not be obtained
///
/// The same value is handed to every caller that waited on a given fetch,
/// so the underlying fetch error is shared rather than owned.
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// The token fetcher returned an error
    #[error("error fetching access token")]
    Fetch(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The token fetcher reported success but the token was empty
    #[error("token fetcher returned an empty token")]
    EmptyToken,
    /// The caller stopped waiting before a token was available
    #[error("cancelled while waiting for an access token")]
    Cancelled,
    /// The fetch ended without reporting any outcome
    #[error("token fetch ended without producing a result")]
    Abandoned,
}

impl TokenError {
    pub(crate) fn fetch(error: BoxError) -> Self {
        Self::Fetch(Arc::from(error))
    }

    /// Attempts to view the fetcher's error as a concrete type
    pub fn fetch_error<E: error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Fetch(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}
