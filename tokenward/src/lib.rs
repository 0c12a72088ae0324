//! Cached, single-flight management of short-lived access tokens
//!
//! Many upstream APIs hand out bearer credentials that live for a couple of
//! hours and rate limit how often new ones may be requested. Clients of such
//! APIs want three things: reuse the current token for as long as it is good,
//! replace it a little before it actually expires, and never have a crowd of
//! concurrent requests all ask the authority for a new token at once.
//!
//! [`TokenManager`] provides exactly that on top of two pluggable parts:
//!
//! * an [`ExpiringCache`][cache::ExpiringCache], where the current token is
//!   kept. [`MemoryCache`][cache::MemoryCache] is provided; a cache shared
//!   between processes (Redis, a database table) can be plugged in instead.
//! * a [`TokenFetcher`][sources::TokenFetcher], which performs the actual
//!   exchange with the token authority.
//!
//! When the cache is empty, one caller becomes the _leader_ and starts a fetch.
//! Every caller that arrives while that fetch is running joins it and receives
//! the same token, or the same error. Fetched tokens are cached for their
//! reported lifetime minus an expire buffer (five minutes by default), so a
//! token is never served right before the authority stops accepting it.
//!
//! ```
//! use tokenward::{
//!     cache::MemoryCache,
//!     sources::{fn_fetcher, FetchedToken},
//!     AppIdRef, BoxError, CacheKey, TokenManager,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = fn_fetcher(|| async {
//!     // Exchange credentials with the authority here
//!     Ok::<_, BoxError>(FetchedToken::new("issued-token", 7200))
//! });
//!
//! let manager = TokenManager::builder()
//!     .cache(MemoryCache::new())
//!     .cache_key(CacheKey::namespaced(
//!         "miniprogram:access_token:",
//!         AppIdRef::from_static("wx123"),
//!     ))
//!     .fetcher(fetcher)
//!     .build()?;
//!
//! let token = manager.get_token().await?;
//!
//! // Later, if the upstream API rejects the token:
//! let token = manager.refresh_token().await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `client-credential` (default): Provides
//!   [`ClientCredentialFetcher`][sources::client_credential::ClientCredentialFetcher],
//!   which exchanges an application ID and secret for a token over HTTP.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod cache;
mod error;
mod manager;
pub mod sources;

pub use braids::*;
pub use error::{BoxError, CacheError, ConfigError, TokenError};
pub use manager::{TokenManager, TokenManagerBuilder, DEFAULT_EXPIRE_BUFFER_SECS};
