//! Outcome classification for upstream attempts
//!
//! Maps a response status to the dispatcher's next move, reads the
//! retry-after hint on 429 responses, and decides which network failures
//! are worth retrying.

use std::time::Duration;

use provider::ErrorClassification;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::transport::{TransportError, TransportErrorKind};

/// Hold applied when a 429 carries no usable retry-after value.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Base delay for exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Message fragments that mark a transport failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "etimedout",
    "timed out",
    "timeout",
    "enotfound",
    "dns error",
    "failed to lookup address",
    "name resolution",
    "network",
    "fetch failed",
];

/// Classify a response status.
///
/// 2xx succeed, 429 is a rate limit, 401/403 reject the credential,
/// 5xx are server errors, and everything else is terminal.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        200..=299 => ErrorClassification::Success,
        429 => ErrorClassification::RateLimited,
        401 | 403 => ErrorClassification::AuthFailed,
        s if s >= 500 => ErrorClassification::ServerError,
        _ => ErrorClassification::Terminal,
    }
}

/// Seconds to hold an account after a 429.
///
/// Reads `retry-after` as whole seconds; absent or unparseable values fall
/// back to `DEFAULT_RETRY_AFTER_SECS`.
pub fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Whether a transport failure should be retried with backoff.
pub fn is_transient_network_error(error: &TransportError) -> bool {
    match error.kind {
        TransportErrorKind::Timeout | TransportErrorKind::Connect => true,
        TransportErrorKind::Other => {
            let lower = error.message.to_lowercase();
            TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
        }
    }
}

/// Backoff for the given retry count: `BACKOFF_BASE * 2^retries`.
pub fn backoff_delay(retries: u32) -> Duration {
    BACKOFF_BASE.saturating_mul(2u32.saturating_pow(retries))
}
