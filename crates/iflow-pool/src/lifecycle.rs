//! Request-time token lifecycle
//!
//! OAuth accounts carry an access token with an expiry. Before an account is
//! used, the dispatcher checks it with `is_expired` (60 s skew) and, when
//! stale, exchanges the refresh token for a new credential set. Static-key
//! accounts never expire and refresh is a no-op for them.

use common::Secret;
use iflow_auth::{Account, AuthMethod, TokenExchange, access_token_expired};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;

/// New credential material produced by a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialUpdate {
    pub static_key: Secret<String>,
    pub access_token: Option<Secret<String>>,
    /// Present only when the exchange issued a new refresh token
    pub refresh_token: Option<Secret<String>>,
    pub expires_at: Option<u64>,
    pub label: Option<String>,
}

impl CredentialUpdate {
    /// The account's current credentials, unchanged.
    pub fn unchanged(account: &Account) -> Self {
        let (access_token, expires_at) = match &account.auth {
            AuthMethod::OAuth {
                access_token,
                expires_at,
                ..
            } => (access_token.clone(), *expires_at),
            AuthMethod::ApiKey => (None, None),
        };
        Self {
            static_key: account.static_key.clone(),
            access_token,
            refresh_token: None,
            expires_at,
            label: None,
        }
    }
}

/// Whether the account's access token needs a refresh at `now`.
///
/// Static-key accounts and OAuth accounts without a recorded expiry never
/// expire.
pub fn is_expired(account: &Account, now: u64) -> bool {
    match account.expires_at() {
        Some(expires_at) if account.is_token_based() => access_token_expired(expires_at, now),
        _ => false,
    }
}

/// Exchange the account's refresh token for new credentials.
pub async fn refresh(exchange: &dyn TokenExchange, account: &Account) -> Result<CredentialUpdate> {
    if !account.is_token_based() {
        return Ok(CredentialUpdate::unchanged(account));
    }
    let Some(refresh_token) = account.refresh_token() else {
        return Err(Error::TokenRefreshFailed(format!(
            "account {} has no refresh token",
            account.id
        )));
    };

    let refreshed = exchange
        .refresh(refresh_token.expose())
        .await
        .map_err(|e| Error::TokenRefreshFailed(e.to_string()))?;

    let reissued = (!refreshed.refresh_token.is_empty()
        && refreshed.refresh_token != *refresh_token.expose())
    .then(|| Secret::new(refreshed.refresh_token));

    Ok(CredentialUpdate {
        static_key: Secret::new(refreshed.api_key),
        access_token: Some(Secret::new(refreshed.access_token)),
        refresh_token: reissued,
        expires_at: Some(refreshed.expires_at),
        label: refreshed.email,
    })
}

/// Refresh the account if its token is stale, then apply the update to the
/// pool and persist it. Returns the account to use for the attempt.
///
/// A persistence failure after a successful refresh is logged; the refreshed
/// credential is still used.
pub async fn refresh_if_expired(
    pool: &Pool,
    exchange: &dyn TokenExchange,
    account: Account,
) -> Result<Account> {
    let now = pool.clock().now_millis();
    if !is_expired(&account, now) {
        return Ok(account);
    }

    debug!(account_id = %account.id, "access token expired, refreshing");
    let update = refresh(exchange, &account).await?;
    let updated = pool
        .update_credential(&account.id, &update)
        .await
        .ok_or_else(|| {
            Error::TokenRefreshFailed(format!("account {} left the pool during refresh", account.id))
        })?;

    if let Err(e) = pool.save().await {
        warn!(account_id = %account.id, error = %e, "failed to persist refreshed credential");
    }
    info!(account_id = %account.id, expires_at = ?update.expires_at, "token refreshed");
    metrics::counter!("pool_account_events_total", "event" => "refreshed").increment(1);
    Ok(updated)
}
