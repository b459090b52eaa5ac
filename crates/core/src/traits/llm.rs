//! Language model contract.

use futures::stream::BoxStream;
use serde_json::Value;

use crate::conversation::{ChatMessage, ToolCallRequest};
use crate::error::LlmError;

/// A tool made available to the model, in descriptor form.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the parameters.
    pub parameters: Value,
}

/// One request to the model: a message window plus the tools it may call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// Streamed model output. A stream yields any number of `Token` events and
/// at most one terminal `ToolCalls` event; tool calls end the round.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Token(String),
    ToolCalls(Vec<ToolCallRequest>),
}

pub type LlmStream = BoxStream<'static, Result<LlmEvent, LlmError>>;

/// Language model adapter.
///
/// Dropping the returned stream must close the upstream connection; that is
/// how the orchestrator cancels a round on barge-in.
pub trait LanguageModel: Send + Sync {
    fn stream(&self, request: ChatRequest) -> LlmStream;
}
