//! A token fetcher that exchanges an application ID and secret for a token

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::{FetchedToken, TokenFetcher};
use crate::{AccessToken, AppId, AppSecret, BoxError};

mod dto;

/// The default token endpoint of the WeChat platform
pub const DEFAULT_TOKEN_URL: &str = "https://api.weixin.qq.com/cgi-bin/token";

const GRANT_TYPE: &str = "client_credential";

/// An error code reported in-band by the authority
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("authority rejected token request: [{errcode}] {errmsg}")]
pub struct UpstreamError {
    /// The numeric error code
    pub errcode: i64,
    /// The authority's description of the error
    pub errmsg: String,
}

impl UpstreamError {
    /// The access token is invalid
    pub const INVALID_TOKEN: i64 = 40001;
    /// The access token has expired
    pub const EXPIRED_TOKEN: i64 = 42001;
    /// The application ID is not recognized
    pub const INVALID_APP_ID: i64 = 40013;
    /// The application secret is wrong
    pub const INVALID_APP_SECRET: i64 = 40125;
    /// The authority is rate limiting this application
    pub const RATE_LIMITED: i64 = 45011;

    /// Whether this error means the access token used must be refreshed
    pub fn is_token_error(&self) -> bool {
        self.errcode == Self::INVALID_TOKEN || self.errcode == Self::EXPIRED_TOKEN
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The authority answered with an in-band error code
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(reqwest::Error),
}

/// Fetches tokens using the client credential grant
///
/// Each call performs exactly one request; no retries are attempted.
#[derive(Debug)]
pub struct ClientCredentialFetcher {
    client: reqwest::Client,
    token_url: reqwest::Url,
    app_id: AppId,
    app_secret: AppSecret,
    timeout: Duration,
}

impl ClientCredentialFetcher {
    /// Constructs a fetcher against [`DEFAULT_TOKEN_URL`] with a 10 second
    /// request timeout
    pub fn new(client: reqwest::Client, app_id: AppId, app_secret: AppSecret) -> Self {
        Self {
            client,
            token_url: reqwest::Url::parse(DEFAULT_TOKEN_URL).expect("default token URL is valid"),
            app_id,
            app_secret,
            timeout: Duration::from_secs(10),
        }
    }

    /// Sends token requests to `token_url` instead of the default endpoint
    pub fn with_token_url(mut self, token_url: reqwest::Url) -> Self {
        self.token_url = token_url;
        self
    }

    /// Sets the timeout applied to each token request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The application this fetcher requests tokens for
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Requests a token from the authority
    #[tracing::instrument(
        err,
        skip(self),
        fields(
            token_url = %self.token_url,
            app_id = %self.app_id,
        ),
    )]
    pub async fn request_token(&self) -> Result<FetchedToken, TokenRequestError> {
        tracing::trace!("requesting token from authority");

        let query = dto::TokenQuery {
            grant_type: GRANT_TYPE,
            appid: &self.app_id,
            secret: &self.app_secret,
        };

        let resp = self
            .client
            .get(self.token_url.clone())
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(TokenRequestError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received token response from issuing authority"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp
                .text()
                .await
                .map_err(TokenRequestError::BodyReadError)?;
            return Err(TokenRequestError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(TokenRequestError::BodyReadError)?;

        let token = interpret_response(&body)?;

        tracing::info!(expires_in = token.expires_in, "received new access token");

        Ok(token)
    }
}

fn interpret_response(body: &[u8]) -> Result<FetchedToken, TokenRequestError> {
    let resp: dto::TokenResponse = serde_json::from_slice(body)?;

    if resp.errcode != 0 {
        tracing::warn!(
            errcode = resp.errcode,
            errmsg = %resp.errmsg,
            "authority rejected token request"
        );
        return Err(UpstreamError {
            errcode: resp.errcode,
            errmsg: resp.errmsg,
        }
        .into());
    }

    // An empty token is passed through; the manager rejects it.
    Ok(FetchedToken {
        access_token: resp
            .access_token
            .unwrap_or_else(|| AccessToken::new(String::new())),
        expires_in: resp.expires_in,
    })
}

#[async_trait]
impl TokenFetcher for ClientCredentialFetcher {
    async fn fetch_token(&self) -> Result<FetchedToken, BoxError> {
        Ok(self.request_token().await?)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher_for(server: &MockServer) -> ClientCredentialFetcher {
        let token_url = format!("{}/cgi-bin/token", server.uri()).parse().unwrap();
        ClientCredentialFetcher::new(
            reqwest::Client::new(),
            AppId::from_static("wx-test-app"),
            AppSecret::from_static("shh"),
        )
        .with_token_url(token_url)
    }

    #[test]
    fn decodes_successful_response() {
        let token =
            interpret_response(br#"{"access_token":"abc","expires_in":7200}"#).unwrap();
        assert_eq!(token.access_token.as_str(), "abc");
        assert_eq!(token.expires_in, 7200);
    }

    #[test]
    fn decodes_in_band_error() {
        let err = interpret_response(br#"{"errcode":40013,"errmsg":"invalid appid"}"#)
            .unwrap_err();
        match err {
            TokenRequestError::Upstream(upstream) => {
                assert_eq!(upstream.errcode, UpstreamError::INVALID_APP_ID);
                assert_eq!(upstream.errmsg, "invalid appid");
                assert!(!upstream.is_token_error());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_token_is_passed_through_as_empty() {
        let token = interpret_response(br#"{"expires_in":7200}"#).unwrap();
        assert!(token.access_token.as_str().is_empty());
    }

    #[test]
    fn malformed_body_is_a_body_error() {
        let err = interpret_response(b"<html>").unwrap_err();
        assert!(matches!(err, TokenRequestError::TokenBodyError(_)));
    }

    #[test]
    fn token_errors_are_recognized() {
        for errcode in [UpstreamError::INVALID_TOKEN, UpstreamError::EXPIRED_TOKEN] {
            let err = UpstreamError {
                errcode,
                errmsg: String::new(),
            };
            assert!(err.is_token_error());
        }
    }

    #[tokio::test]
    async fn sends_credentials_as_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .and(query_param("grant_type", "client_credential"))
            .and(query_param("appid", "wx-test-app"))
            .and(query_param("secret", "shh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "issued-token",
                "expires_in": 7200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = fetcher_for(&server).request_token().await.unwrap();

        assert_eq!(token.access_token.as_str(), "issued-token");
        assert_eq!(token.expires_in, 7200);
    }

    #[tokio::test]
    async fn http_error_status_keeps_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let err = fetcher_for(&server).request_token().await.unwrap_err();

        match err {
            TokenRequestError::ErrorWithBody { body, .. } => assert_eq!(body, "try later"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn upstream_error_survives_boxing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 45011,
                "errmsg": "api freq out of limit"
            })))
            .mount(&server)
            .await;

        let err = fetcher_for(&server).fetch_token().await.unwrap_err();
        let request_error = err.downcast_ref::<TokenRequestError>().unwrap();

        assert!(matches!(
            request_error,
            TokenRequestError::Upstream(UpstreamError {
                errcode: UpstreamError::RATE_LIMITED,
                ..
            })
        ));
    }
}
