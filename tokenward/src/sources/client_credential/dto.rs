//! DTOs for the client credential token exchange

use serde::{Deserialize, Serialize};

use crate::{AccessToken, AppIdRef, AppSecretRef};

/// Query parameters for a client credential token request
#[derive(Debug, Serialize)]
pub(super) struct TokenQuery<'a> {
    pub grant_type: &'static str,
    pub appid: &'a AppIdRef,
    pub secret: &'a AppSecretRef,
}

/// The authority's response body
///
/// Failures are reported in-band with a nonzero `errcode`, often alongside an
/// HTTP 200 status.
#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}
