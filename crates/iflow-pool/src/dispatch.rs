//! Resilient dispatcher
//!
//! Turns one logical request into a bounded, strictly serial sequence of
//! attempts across the pool. Each request runs as an explicit state machine:
//!
//! ```text
//! SelectAccount ─▶ RefreshToken ─▶ Send ─▶ Classify ─┬─▶ done
//!      ▲                │                            │
//!      │◀─ refresh failed                            │
//!      │◀──────────── Backoff ◀──────────────────────┤ 429, 5xx, transient network
//!      └◀────────────────────────────────────────────┘ 401/403, 5xx retries exhausted
//! ```
//!
//! Every entry into `SelectAccount` counts one iteration and checks both
//! budgets (iteration ceiling and wall-clock timeout), so sleeps for rate
//! limits and backoff are bounded too.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iflow_auth::{Account, TokenExchange};
use provider::{ErrorClassification, Provider};
use reqwest::Method;
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use tracing::{debug, error, info, instrument, warn};

use crate::classify::{backoff_delay, classify_status, is_transient_network_error, parse_retry_after};
use crate::error::{Budget, Error, Result};
use crate::lifecycle::refresh_if_expired;
use crate::pool::Pool;
use crate::transport::{PreparedRequest, Transport, TransportError, UpstreamResponse};

/// Unhealthy cooldown, whatever the cause.
pub const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Pause after a 429 before selecting again.
pub const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(1);

/// Longest single sleep while every account is rate limited.
pub const MAX_IDLE_WAIT: Duration = Duration::from_secs(5);

/// Retries per request for each of server errors and transient network errors.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on loop iterations per logical request
    pub max_iterations: u32,
    /// Wall-clock budget per logical request
    pub timeout: Duration,
    /// Log the shaped outbound body at debug level
    pub log_request_bodies: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            timeout: Duration::from_millis(300_000),
            log_request_bodies: false,
        }
    }
}

/// A caller's request before credentials are attached.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// JSON body; `None` is sent as `{}`
    pub body: Option<serde_json::Value>,
}

enum Phase {
    SelectAccount,
    RefreshToken(Account),
    Send(Account),
    Classify(Account, std::result::Result<UpstreamResponse, TransportError>),
    Backoff(Duration),
}

enum Transition {
    Finish(UpstreamResponse),
    Next(Phase),
}

/// Per-request counters.
struct Attempts {
    attempt: u32,
    started_at: u64,
    server_error_retries: u32,
    network_error_retries: u32,
}

impl Attempts {
    fn new(started_at: u64) -> Self {
        Self {
            attempt: 0,
            started_at,
            server_error_retries: 0,
            network_error_retries: 0,
        }
    }

    /// Count one iteration and enforce both budgets.
    fn begin_iteration(&mut self, now: u64, config: &DispatchConfig) -> Result<()> {
        self.attempt += 1;
        if self.attempt > config.max_iterations {
            return Err(Error::BudgetExceeded(Budget::Iterations(config.max_iterations)));
        }
        if now.saturating_sub(self.started_at) > config.timeout.as_millis() as u64 {
            return Err(Error::BudgetExceeded(Budget::Time(config.timeout)));
        }
        Ok(())
    }
}

/// Sends requests upstream on behalf of the pool's accounts.
pub struct Dispatcher {
    pool: Arc<Pool>,
    transport: Arc<dyn Transport>,
    exchange: Arc<dyn TokenExchange>,
    provider: Arc<dyn Provider>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<Pool>,
        transport: Arc<dyn Transport>,
        exchange: Arc<dyn TokenExchange>,
        provider: Arc<dyn Provider>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            pool,
            transport,
            exchange,
            provider,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run one logical request to completion.
    ///
    /// Rate limits, auth failures, retryable server and network errors, and
    /// refresh failures are handled by mutating account state and looping.
    /// Only budget exhaustion, an empty or exhausted pool, exhausted network
    /// retries, and terminal statuses reach the caller.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn fetch(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        let clock = self.pool.clock().clone();
        let body = self.shape_body(request.body.clone());
        let mut attempts = Attempts::new(clock.now_millis());
        let mut phase = Phase::SelectAccount;

        loop {
            phase = match phase {
                Phase::SelectAccount => {
                    attempts.begin_iteration(clock.now_millis(), &self.config)?;
                    self.select().await?
                }
                Phase::RefreshToken(account) => {
                    match refresh_if_expired(&self.pool, self.exchange.as_ref(), account.clone())
                        .await
                    {
                        Ok(account) => Phase::Send(account),
                        Err(e) => {
                            warn!(account_id = %account.id, error = %e, "token refresh failed, trying another account");
                            self.cool_down(&account, "refresh failed").await;
                            Phase::SelectAccount
                        }
                    }
                }
                Phase::Send(account) => match self.prepare(&request, &body, &account) {
                    Some(prepared) => {
                        debug!(account_id = %account.id, attempt = attempts.attempt, "sending attempt");
                        let outcome = self.transport.send(prepared).await;
                        Phase::Classify(account, outcome)
                    }
                    None => {
                        warn!(account_id = %account.id, "credential is not a valid header value");
                        self.cool_down(&account, "invalid credential").await;
                        Phase::SelectAccount
                    }
                },
                Phase::Classify(account, outcome) => {
                    match self.classify(&account, outcome, &mut attempts).await? {
                        Transition::Finish(response) => {
                            debug!(
                                account_id = %account.id,
                                status = response.status,
                                attempts = attempts.attempt,
                                "request completed"
                            );
                            return Ok(response);
                        }
                        Transition::Next(next) => next,
                    }
                }
                Phase::Backoff(delay) => {
                    clock.sleep(delay).await;
                    Phase::SelectAccount
                }
            };
        }
    }

    /// Pick the next account, or decide whether waiting can help.
    async fn select(&self) -> Result<Phase> {
        if self.pool.is_empty().await {
            return Err(Error::NoAccounts);
        }
        if let Some(account) = self.pool.select_account().await {
            return Ok(Phase::RefreshToken(account));
        }
        let wait = self.pool.min_wait_time().await;
        if wait.is_zero() {
            warn!("no account will become available");
            return Err(Error::NoHealthyAccount);
        }
        let delay = wait.min(MAX_IDLE_WAIT);
        info!(wait_ms = wait.as_millis() as u64, "all accounts rate limited, waiting");
        Ok(Phase::Backoff(delay))
    }

    /// Decide the next phase from an attempt's outcome.
    async fn classify(
        &self,
        account: &Account,
        outcome: std::result::Result<UpstreamResponse, TransportError>,
        attempts: &mut Attempts,
    ) -> Result<Transition> {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                record_attempt("network_error");
                if is_transient_network_error(&e)
                    && attempts.network_error_retries < MAX_TRANSIENT_RETRIES
                {
                    attempts.network_error_retries += 1;
                    let delay = backoff_delay(attempts.network_error_retries);
                    warn!(
                        account_id = %account.id,
                        error = %e,
                        retry = attempts.network_error_retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient network error, backing off"
                    );
                    return Ok(Transition::Next(Phase::Backoff(delay)));
                }
                error!(account_id = %account.id, error = %e, "network error");
                return Err(Error::Network(e.message));
            }
        };

        let classification = classify_status(response.status);
        record_attempt(classification.label());

        match classification {
            ErrorClassification::Success => Ok(Transition::Finish(response)),
            ErrorClassification::RateLimited => {
                let retry_after = parse_retry_after(&response.headers);
                self.pool
                    .mark_rate_limited(&account.id, Duration::from_secs(retry_after))
                    .await;
                Ok(Transition::Next(Phase::Backoff(RATE_LIMIT_PAUSE)))
            }
            ErrorClassification::AuthFailed => {
                self.cool_down(account, "authentication failed").await;
                Ok(Transition::Next(Phase::SelectAccount))
            }
            ErrorClassification::ServerError => {
                if attempts.server_error_retries < MAX_TRANSIENT_RETRIES {
                    attempts.server_error_retries += 1;
                    let delay = backoff_delay(attempts.server_error_retries);
                    warn!(
                        account_id = %account.id,
                        status = response.status,
                        retry = attempts.server_error_retries,
                        delay_ms = delay.as_millis() as u64,
                        "upstream server error, backing off"
                    );
                    Ok(Transition::Next(Phase::Backoff(delay)))
                } else {
                    self.cool_down(account, "server error").await;
                    Ok(Transition::Next(Phase::SelectAccount))
                }
            }
            ErrorClassification::Terminal => {
                let body = String::from_utf8_lossy(&response.body).into_owned();
                warn!(account_id = %account.id, status = response.status, "terminal upstream status");
                Err(Error::Upstream {
                    status: response.status,
                    headers: response.headers,
                    body,
                })
            }
        }
    }

    async fn cool_down(&self, account: &Account, reason: &str) {
        let recovery_at = self
            .pool
            .clock()
            .now_millis()
            .saturating_add(UNHEALTHY_COOLDOWN.as_millis() as u64);
        self.pool.mark_unhealthy(&account.id, reason, recovery_at).await;
    }

    /// Apply provider shaping to the caller's body and serialize it.
    fn shape_body(&self, body: Option<serde_json::Value>) -> Bytes {
        let body = body.unwrap_or_else(|| serde_json::json!({}));
        let model = provider::extract_model(&body)
            .unwrap_or(self.provider.default_model())
            .to_string();
        let shaped = self.provider.transform_body(body, &model);
        if self.config.log_request_bodies {
            debug!(provider = self.provider.id(), model, body = %shaped, "outbound request body");
        }
        Bytes::from(shaped.to_string())
    }

    /// Attach the account's credential. The three forced headers replace any
    /// caller values; every other caller header is kept.
    fn prepare(
        &self,
        request: &OutboundRequest,
        body: &Bytes,
        account: &Account,
    ) -> Option<PreparedRequest> {
        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", account.static_key.expose())).ok()?;
        authorization.set_sensitive(true);

        let mut headers = request.headers.clone();
        headers.remove(CONTENT_LENGTH);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(USER_AGENT, HeaderValue::from_static(iflow_auth::USER_AGENT));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Some(PreparedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers,
            body: body.clone(),
        })
    }
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("pool_dispatch_attempts_total", "outcome" => outcome).increment(1);
}
