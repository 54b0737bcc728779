//! Provider abstraction for upstream request shaping
//!
//! Defines the `Provider` trait that decouples the dispatcher from any one
//! upstream's request conventions. The dispatcher hands every outbound JSON
//! body to `transform_body` before attaching credentials; providers use it
//! to inject model-specific parameters. `PassthroughProvider` leaves bodies
//! untouched, `IflowProvider` enables thinking mode for GLM models.

pub mod iflow;
pub mod passthrough;

pub use iflow::IflowProvider;
pub use passthrough::PassthroughProvider;

/// Classification of a completed upstream attempt, driving the dispatcher's
/// next move.
///
/// - `Success` ends the request
/// - `RateLimited` puts the account on a timed hold and fails over
/// - `AuthFailed` marks the account unhealthy and fails over
/// - `ServerError` backs off and retries, then marks unhealthy
/// - `Terminal` is returned to the caller as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// 2xx
    Success,
    /// 429
    RateLimited,
    /// 401/403, the credential was rejected
    AuthFailed,
    /// 5xx
    ServerError,
    /// Any other non-2xx status
    Terminal,
}

impl ErrorClassification {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Success => "success",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::AuthFailed => "auth_failed",
            ErrorClassification::ServerError => "server_error",
            ErrorClassification::Terminal => "terminal",
        }
    }
}

/// Provider-specific request shaping.
///
/// `transform_body` must be pure. The dispatcher calls it once per logical
/// request and reuses the shaped body for every retry and failover attempt.
pub trait Provider: Send + Sync {
    /// Identifier for logging (e.g. "iflow", "passthrough")
    fn id(&self) -> &str;

    /// Model assumed when the request body names none.
    fn default_model(&self) -> &str;

    /// Rewrite the JSON request body for the given model.
    fn transform_body(&self, body: serde_json::Value, model: &str) -> serde_json::Value;
}

/// Extract the model name from a request body JSON object.
pub fn extract_model(body: &serde_json::Value) -> Option<&str> {
    body.get("model").and_then(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_reads_string_field() {
        let body = serde_json::json!({"model": "glm-4.6", "messages": []});
        assert_eq!(extract_model(&body), Some("glm-4.6"));
    }

    #[test]
    fn extract_model_ignores_missing_or_non_string() {
        assert_eq!(extract_model(&serde_json::json!({})), None);
        assert_eq!(extract_model(&serde_json::json!({"model": 42})), None);
        assert_eq!(extract_model(&serde_json::Value::Null), None);
    }

    #[test]
    fn classification_labels_are_stable() {
        assert_eq!(ErrorClassification::Success.label(), "success");
        assert_eq!(ErrorClassification::RateLimited.label(), "rate_limited");
        assert_eq!(ErrorClassification::AuthFailed.label(), "auth_failed");
        assert_eq!(ErrorClassification::ServerError.label(), "server_error");
        assert_eq!(ErrorClassification::Terminal.label(), "terminal");
    }
}
