//! Error types for pool and dispatch operations

use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderMap;

/// Which dispatch budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Iteration ceiling reached (the configured maximum)
    Iterations(u32),
    /// Wall-clock budget exceeded (the configured timeout)
    Time(Duration),
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Iterations(max) => write!(f, "max iterations ({max}) reached"),
            Budget::Time(timeout) => write!(f, "timeout after {}s", timeout.as_secs()),
        }
    }
}

/// Errors surfaced to the caller of a pool or dispatch operation.
///
/// Rate limits, auth failures, retryable server errors, transient network
/// errors and refresh failures are absorbed by the dispatcher; only the
/// variants below ever reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no accounts configured, add an account first")]
    NoAccounts,

    #[error("no healthy accounts available")]
    NoHealthyAccount,

    #[error("request budget exceeded: {0}; all accounts may be unhealthy or rate-limited")]
    BudgetExceeded(Budget),

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("network error: {0}")]
    Network(String),

    /// Terminal upstream status. Headers are kept so the response can be
    /// relayed as received.
    #[error("upstream returned {status}: {body}")]
    Upstream {
        status: u16,
        headers: HeaderMap,
        body: String,
    },

    #[error("account persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Label for metrics and error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoAccounts => "no_accounts",
            Error::NoHealthyAccount => "no_healthy_account",
            Error::BudgetExceeded(Budget::Iterations(_)) => "budget_iterations",
            Error::BudgetExceeded(Budget::Time(_)) => "budget_time",
            Error::TokenRefreshFailed(_) => "token_refresh_failed",
            Error::Network(_) => "network_error",
            Error::Upstream { .. } => "upstream_error",
            Error::Persistence(_) => "persistence_error",
        }
    }
}

impl From<iflow_auth::Error> for Error {
    fn from(e: iflow_auth::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
