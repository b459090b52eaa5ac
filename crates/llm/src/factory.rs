//! Provider factory.
//!
//! Maps an agent's `provider` tag to a configured backend through a static
//! table. Unknown tags fail fast at session construction rather than at the
//! first turn.

use std::sync::Arc;
use std::time::Duration;

use voice_broker_core::{LanguageModel, LlmError, ProviderSelection};

use crate::backend::{OpenAiBackend, OpenAiConfig};

/// Known chat providers, all speaking the OpenAI-compatible dialect.
/// `endpoint` in the selection config overrides the default.
const PROVIDER_ENDPOINTS: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("ollama", "http://localhost:11434/v1"),
    ("vllm", "http://localhost:8000/v1"),
];

fn default_endpoint(tag: &str) -> Option<&'static str> {
    PROVIDER_ENDPOINTS
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, e)| *e)
}

fn requires_api_key(tag: &str) -> bool {
    matches!(tag, "openai" | "groq")
}

/// Build a language model from an agent's provider selection.
pub fn create_language_model(
    selection: &ProviderSelection,
) -> Result<Arc<dyn LanguageModel>, LlmError> {
    let tag = selection.provider.as_str();

    let endpoint = selection
        .config_str("endpoint")
        .map(str::to_string)
        .or_else(|| default_endpoint(tag).map(str::to_string))
        .ok_or_else(|| {
            LlmError::Configuration(format!(
                "unknown llm provider '{tag}' and no endpoint configured"
            ))
        })?;

    let api_key = selection.config_str("api_key").map(str::to_string);
    if api_key.is_none() && requires_api_key(tag) {
        return Err(LlmError::Configuration(format!(
            "provider '{tag}' requires an api_key"
        )));
    }

    let model = selection
        .config_str("model")
        .ok_or_else(|| LlmError::Configuration(format!("provider '{tag}' requires a model")))?
        .to_string();

    let config = OpenAiConfig {
        endpoint,
        api_key,
        model,
        temperature: selection
            .config
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
            .unwrap_or(0.7),
        max_tokens: selection
            .config
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(512),
        timeout: Duration::from_secs(60),
    };

    tracing::info!(provider = tag, model = %config.model, "created language model backend");
    Ok(Arc::new(OpenAiBackend::new(config)?))
}
