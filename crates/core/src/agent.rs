//! Agent profiles and provider selections.
//!
//! An agent is a configuration of providers and prompt that defines one
//! conversational persona. Profiles are immutable from a session's point of
//! view; the admin plane owns their lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Selection of a concrete provider plus its opaque configuration bag.
///
/// The schema of `config` is owned by the provider shim; the broker only
/// carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: String,
    #[serde(default)]
    pub config: Value,
}

impl ProviderSelection {
    pub fn new(provider: impl Into<String>, config: Value) -> Self {
        Self {
            provider: provider.into(),
            config,
        }
    }

    /// Read a string key out of the config bag.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Binding of a tool to an agent, selecting the integration that backs it.
///
/// `tool_slug` is unique per agent. `integration_config` is an opaque map
/// whose schema is owned by the integration class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBinding {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tool_slug: String,
    pub integration_slug: String,
    #[serde(default)]
    pub integration_config: Value,
    pub enabled: bool,
}

/// Retrieval configuration attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    pub collection_name: String,
    pub embedding_model: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_top_k() -> usize {
    5
}

/// One conversational persona: prompt template plus provider selections and
/// the ordered set of enabled tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub stt: ProviderSelection,
    pub llm: ProviderSelection,
    pub tts: ProviderSelection,
    #[serde(default)]
    pub tools: Vec<ToolBinding>,
    #[serde(default)]
    pub rag: Option<RagSettings>,
}

impl AgentProfile {
    /// Enabled binding for a tool slug, if any.
    pub fn binding(&self, tool_slug: &str) -> Option<&ToolBinding> {
        self.tools
            .iter()
            .find(|b| b.tool_slug == tool_slug && b.enabled)
    }

    pub fn enabled_tools(&self) -> impl Iterator<Item = &ToolBinding> {
        self.tools.iter().filter(|b| b.enabled)
    }
}
