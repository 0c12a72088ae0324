//! Middleware to automatically attach access tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach
//! the token held by a [`TokenManager`] to each outbound request. The token
//! is fetched on first use and cached by the manager; concurrent requests
//! never trigger more than one fetch.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use tokenward::{cache::MemoryCache, sources::ConstTokenFetcher, TokenManager};
//! use tokenward_reqwest::AccessTokenMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let manager = TokenManager::builder()
//!     .cache(MemoryCache::new())
//!     .cache_key("example:access_token")
//!     .fetcher(ConstTokenFetcher::new("token"))
//!     .build()
//!     .unwrap();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(manager))
//!     .build();
//!
//! let req = client.get("https://example.com");
//! # let _ = req;
//! ```
//!
//! Some APIs expect the token as a query parameter rather than a header.
//! The middleware can be switched to that placement, and can be configured
//! to add a token only conditionally. Predicates can be composed together to
//! evaluate more complex requirements prior to attaching a token to a request.
//!
//! ```
//! use tokenward_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//! # use tokenward::{cache::MemoryCache, sources::ConstTokenFetcher, TokenManager};
//! # let manager = TokenManager::builder()
//! #     .cache(MemoryCache::new())
//! #     .cache_key("example:access_token")
//! #     .fetcher(ConstTokenFetcher::new("token"))
//! #     .build()
//! #     .unwrap();
//!
//! AccessTokenMiddleware::new(manager)
//!     .with_query_parameter("access_token")
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.weixin.qq.com")));
//! ```
//!
//! When a response comes back `401 Unauthorized` for a request that carried
//! the managed token, the middleware asks the manager to replace that token
//! so that later requests use a fresh one. Many requests rejected with the
//! same token cause a single refresh. The rejected request itself is not
//! retried.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{error, fmt};

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;
use tokenward::{AccessToken, AccessTokenRef, TokenError, TokenManager};

/// The token could not be attached to an outgoing request
#[derive(Debug, Error)]
pub enum AttachTokenError {
    /// The token manager could not provide a token
    #[error("unable to obtain access token")]
    Token(#[from] TokenError),
    /// The token contains bytes that are not allowed in a header
    #[error("access token is not a valid header value")]
    InvalidHeaderValue(#[from] header::InvalidHeaderValue),
}

/// Where on the request the token is placed
#[derive(Clone, Debug, PartialEq, Eq)]
enum Placement {
    AuthorizationHeader,
    QueryParameter(String),
}

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    manager: TokenManager,
    predicate: P,
    placement: Placement,
    refresh_on_unauthorized: bool,
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a token manager
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(manager: TokenManager) -> Self {
        Self {
            manager,
            predicate: HttpsOnly,
            placement: Placement::AuthorizationHeader,
            refresh_on_unauthorized: true,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<Q> {
        AccessTokenMiddleware {
            manager: self.manager,
            predicate,
            placement: self.placement,
            refresh_on_unauthorized: self.refresh_on_unauthorized,
        }
    }

    /// Attaches the token as the query parameter `name` instead of as a
    /// bearer `Authorization` header
    pub fn with_query_parameter(mut self, name: impl Into<String>) -> Self {
        self.placement = Placement::QueryParameter(name.into());
        self
    }

    /// Stops the middleware from refreshing the token when a response is
    /// `401 Unauthorized`
    pub fn without_refresh_on_unauthorized(mut self) -> Self {
        self.refresh_on_unauthorized = false;
        self
    }

    /// Places the token on the request, unless the request already carries one
    ///
    /// Returns the managed token if it was attached.
    async fn attach_token(
        &self,
        req: &mut Request,
    ) -> std::result::Result<Option<AccessToken>, AttachTokenError> {
        let token = match &self.placement {
            Placement::AuthorizationHeader => {
                if req.headers().contains_key(header::AUTHORIZATION) {
                    return Ok(None);
                }

                let token = self.manager.get_token().await?;
                let value = bearer_header_value(&token)?;
                req.headers_mut().insert(header::AUTHORIZATION, value);
                token
            }
            Placement::QueryParameter(name) => {
                if req.url().query_pairs().any(|(k, _)| k == name.as_str()) {
                    return Ok(None);
                }

                let token = self.manager.get_token().await?;
                req.url_mut()
                    .query_pairs_mut()
                    .append_pair(name, token.as_str());
                token
            }
        };

        tracing::trace!(placement = ?self.placement, "attached access token");
        Ok(Some(token))
    }
}

fn bearer_header_value(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, header::InvalidHeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let attached = if self.predicate.eval(&req) {
            self.attach_token(&mut req)
                .await
                .map_err(reqwest_middleware::Error::middleware)?
        } else {
            None
        };

        let resp = next.run(req, extensions).await?;

        let rejected = attached
            .filter(|_| self.refresh_on_unauthorized && resp.status() == StatusCode::UNAUTHORIZED);
        if let Some(rejected) = rejected {
            tracing::debug!("access token rejected by upstream, refreshing");
            if let Err(error) = self.manager.refresh_token_if_current(&rejected).await {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to refresh rejected access token"
                );
            }
        }

        Ok(resp)
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "scheme",
                req.url().scheme().to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "host",
                req.url()
                    .host_str()
                    .unwrap_or("<value not valid utf-8>")
                    .to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
