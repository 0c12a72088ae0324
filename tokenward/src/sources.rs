//! Token fetchers

use std::{fmt, future::Future};

use async_trait::async_trait;

use crate::{AccessToken, BoxError};

#[cfg(feature = "client-credential")]
pub mod client_credential;

/// A token freshly issued by the upstream authority
#[derive(Debug)]
pub struct FetchedToken {
    /// The token itself
    pub access_token: AccessToken,
    /// How long the authority says the token is valid for, in seconds
    pub expires_in: u64,
}

impl FetchedToken {
    /// Constructs a new fetched token
    pub fn new(access_token: impl Into<AccessToken>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
        }
    }
}

/// An asynchronous source of fresh tokens
///
/// This is where the network exchange with the token authority happens.
/// Any timeout or retry policy belongs to the implementation.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Requests a new token from the authority
    async fn fetch_token(&self) -> Result<FetchedToken, BoxError>;
}

/// A token fetcher backed by an async closure
pub struct FnFetcher<F> {
    f: F,
}

/// Wraps an async closure as a [`TokenFetcher`]
///
/// ```
/// use tokenward::{sources::{fn_fetcher, FetchedToken}, BoxError};
///
/// let fetcher = fn_fetcher(|| async { Ok::<_, BoxError>(FetchedToken::new("token", 7200)) });
/// # let _ = fetcher;
/// ```
pub fn fn_fetcher<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchedToken, BoxError>> + Send,
{
    FnFetcher { f }
}

impl<F> fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnFetcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> TokenFetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchedToken, BoxError>> + Send,
{
    async fn fetch_token(&self) -> Result<FetchedToken, BoxError> {
        (self.f)().await
    }
}

/// A token fetcher that always hands out the same token
#[derive(Clone, Debug)]
pub struct ConstTokenFetcher {
    access_token: AccessToken,
    expires_in: u64,
}

impl ConstTokenFetcher {
    /// Constructs a fetcher whose token reports a lifetime of two hours
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: 7200,
        }
    }

    /// Overrides the lifetime reported for the token
    pub fn with_expires_in(mut self, expires_in: u64) -> Self {
        self.expires_in = expires_in;
        self
    }
}

#[async_trait]
impl TokenFetcher for ConstTokenFetcher {
    async fn fetch_token(&self) -> Result<FetchedToken, BoxError> {
        Ok(FetchedToken {
            access_token: self.access_token.clone(),
            expires_in: self.expires_in,
        })
    }
}
