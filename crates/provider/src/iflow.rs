//! iFlow provider: model catalogue and thinking-mode request shaping.
//!
//! GLM-4 models only emit reasoning content when the request carries
//! `chat_template_kwargs.enable_thinking`. Other models are forwarded as-is.

use tracing::debug;

use crate::Provider;

/// Model used when a request body does not name one.
pub const DEFAULT_MODEL: &str = "qwen3-max";

/// Models served by the iFlow API.
pub const SUPPORTED_MODELS: &[&str] = &[
    "iflow-rome-30ba3b",
    "qwen3-coder-plus",
    "qwen3-max",
    "qwen3-vl-plus",
    "qwen3-max-preview",
    "qwen3-32b",
    "qwen3-235b-a22b-thinking-2507",
    "qwen3-235b-a22b-instruct",
    "qwen3-235b",
    "kimi-k2-0905",
    "kimi-k2",
    "glm-4.6",
    "deepseek-v3.2",
    "deepseek-r1",
    "deepseek-v3",
];

/// Whether `model` is listed in the iFlow catalogue.
pub fn is_supported_model(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

/// Request shaping for the iFlow OpenAI-compatible API.
#[derive(Debug, Default)]
pub struct IflowProvider;

impl IflowProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for IflowProvider {
    fn id(&self) -> &str {
        "iflow"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn transform_body(&self, mut body: serde_json::Value, model: &str) -> serde_json::Value {
        if !is_supported_model(model) {
            debug!(model, "model not in iFlow catalogue");
        }
        if !model.starts_with("glm-4") {
            return body;
        }
        if let Some(object) = body.as_object_mut() {
            object.insert(
                "chat_template_kwargs".to_string(),
                serde_json::json!({
                    "enable_thinking": true,
                    "clear_thinking": false,
                }),
            );
            debug!(model, "enabled thinking mode");
        }
        body
    }
}
