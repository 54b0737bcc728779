//! Passthrough provider: forwards request bodies unchanged.

use crate::Provider;

/// Identity body transform, for upstreams that need no request shaping.
pub struct PassthroughProvider {
    default_model: String,
}

impl PassthroughProvider {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
        }
    }
}

impl Provider for PassthroughProvider {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn transform_body(&self, body: serde_json::Value, _model: &str) -> serde_json::Value {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_returned_unchanged() {
        let provider = PassthroughProvider::new("qwen3-max");
        let body = serde_json::json!({"model": "glm-4.6", "stream": true});
        assert_eq!(provider.transform_body(body.clone(), "glm-4.6"), body);
    }

    #[test]
    fn id_and_default_model() {
        let provider = PassthroughProvider::new("qwen3-max");
        assert_eq!(provider.id(), "passthrough");
        assert_eq!(provider.default_model(), "qwen3-max");
    }
}
