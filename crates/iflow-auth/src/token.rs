//! OAuth token refresh and expiry checks
//!
//! A refresh is two calls:
//! 1. POST the refresh token to `OAUTH_TOKEN_URL` (client authenticated with
//!    HTTP Basic) to obtain a new access/refresh token pair
//! 2. GET `USER_INFO_URL` with the new access token to obtain the API key
//!    bound to it, which is the credential actually sent to the inference API

use std::future::Future;
use std::pin::Pin;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CLIENT_ID, CLIENT_SECRET, OAUTH_TOKEN_URL, TOKEN_EXPIRY_SKEW_MILLIS, USER_INFO_URL,
};
use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether an access token expiring at `expires_at` must be refreshed at `now`.
///
/// Both are unix milliseconds. Tokens are considered expired 60 seconds early
/// so a request never races the upstream's own clock.
pub fn access_token_expired(expires_at: u64, now: u64) -> bool {
    now >= expires_at.saturating_sub(TOKEN_EXPIRY_SKEW_MILLIS)
}

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<UserInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

/// Result of a successful refresh, ready to apply to an account.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    /// New bearer credential for the inference API
    pub api_key: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of `access_token`, unix milliseconds
    pub expires_at: u64,
    /// Account label reported by the user-info endpoint
    pub email: Option<String>,
}

/// Exchanges a refresh credential for a fresh access credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenExchange>`).
pub trait TokenExchange: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>>;
}

/// `TokenExchange` against the iFlow OAuth endpoints.
#[derive(Clone)]
pub struct HttpTokenExchange {
    client: reqwest::Client,
    token_url: String,
    user_info_url: String,
}

impl HttpTokenExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoints(client, OAUTH_TOKEN_URL, USER_INFO_URL)
    }

    /// Point the exchange at alternative endpoints (staging, tests).
    pub fn with_endpoints(
        client: reqwest::Client,
        token_url: impl Into<String>,
        user_info_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            user_info_url: user_info_url.into(),
        }
    }

    /// POST the refresh grant to the token endpoint.
    pub async fn refresh_token(&self, refresh: &str) -> Result<TokenResponse> {
        let basic = STANDARD.encode(format!("{CLIENT_ID}:{CLIENT_SECRET}"));
        let response = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the refresh token is revoked or invalid
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
    }

    /// Fetch the API key and label bound to an access token.
    async fn user_info(&self, access_token: &str) -> Result<UserInfo> {
        let response = self
            .client
            .get(&self.user_info_url)
            .query(&[("accessToken", access_token)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("user info request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TokenExchange(format!(
                "user info endpoint returned {status}"
            )));
        }

        let info = response
            .json::<UserInfoResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid user info response: {e}")))?;

        match info.data {
            Some(data) if info.success => Ok(data),
            _ => Err(Error::TokenExchange(
                "user info endpoint reported failure".into(),
            )),
        }
    }

    async fn exchange(&self, refresh: &str) -> Result<RefreshedToken> {
        let issued_at = now_millis();
        let token = self.refresh_token(refresh).await?;
        let info = self.user_info(&token.access_token).await?;

        let api_key = info
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::TokenExchange("user info response has no apiKey".into()))?;

        debug!(expires_in = token.expires_in, "refresh token exchanged");
        Ok(RefreshedToken {
            api_key,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: issued_at + token.expires_in * 1000,
            email: info.email.or(info.phone),
        })
    }
}

impl TokenExchange for HttpTokenExchange {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>> {
        Box::pin(self.exchange(refresh_token))
    }
}
