//! Conversation message types.
//!
//! Messages follow the chat-completions shape: an ordered list of
//! `{role, content, tool_calls?, tool_call_id?}` entries. An assistant
//! message that carries `tool_calls` is immediately followed by one `tool`
//! message per call, in call order, before the next assistant message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{}", s)
    }
}

/// A single tool invocation requested by the model.
///
/// `arguments` is the raw JSON string exactly as the provider produced it;
/// the executor parses it at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry in a conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    /// Assistant message carrying tool calls. Any text the model produced in
    /// the same round is commentary and is not recorded.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(Role::Assistant, None);
        msg.tool_calls = Some(calls);
        msg
    }

    /// Tool result message answering a specific call id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}
