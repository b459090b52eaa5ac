//! OpenAI-compatible streaming backend.
//!
//! Speaks the chat-completions SSE dialect. Text deltas are yielded as they
//! arrive; `tool_calls` deltas are accumulated by their `index` field across
//! chunks and emitted as one consolidated batch when the stream ends. A
//! round yields at most one tool-call batch, and any text received in the
//! same round is provider commentary that the orchestrator discards.
//!
//! Dropping the stream drops the underlying response body, which closes the
//! connection; that is the cancellation path.

use std::collections::BTreeMap;
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use voice_broker_core::{
    ChatMessage, ChatRequest, LanguageModel, LlmError, LlmEvent, LlmStream, Role, ToolCallRequest,
};

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to and including the API version segment.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            timeout: Duration::from_secs(60),
        }
    }
}

/// OpenAI-compatible chat backend. Works against OpenAI, Groq, vLLM, and
/// local servers exposing the same dialect.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(ref key) = self.config.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn build_request(&self, request: &ChatRequest) -> ApiChatRequest {
        let tools: Vec<ApiTool> = request
            .tools
            .iter()
            .map(|t| ApiTool {
                kind: "function".to_string(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();

        ApiChatRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            stream: true,
            tool_choice: if tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }
}

impl LanguageModel for OpenAiBackend {
    fn stream(&self, request: ChatRequest) -> LlmStream {
        let client = self.client.clone();
        let url = self.chat_url();
        let headers = self.headers();
        let body = self.build_request(&request);

        let stream = try_stream! {
            let response = client
                .post(&url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                Err(LlmError::Api {
                    status: status.as_u16(),
                    message,
                })?;
            } else {
                let mut bytes = response.bytes_stream();
                let mut buffer = String::new();
                let mut acc = ToolCallAccumulator::new();
                let mut done = false;

                while let Some(chunk) = bytes.next().await {
                    let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer.drain(..=line_end);

                        if line.is_empty() {
                            continue;
                        }
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            done = true;
                            break;
                        }

                        let parsed: ApiStreamChunk = match serde_json::from_str(data) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                                continue;
                            }
                        };
                        let Some(choice) = parsed.choices.into_iter().next() else {
                            continue;
                        };
                        let Some(delta) = choice.delta else { continue };

                        if let Some(content) = delta.content {
                            if !content.is_empty() {
                                yield LlmEvent::Token(content);
                            }
                        }
                        if let Some(deltas) = delta.tool_calls {
                            for tc in deltas {
                                acc.push(tc);
                            }
                        }
                    }

                    if done {
                        break;
                    }
                }

                // Consolidated tool calls are flushed exactly once, at stream end.
                let calls = acc.finish();
                if !calls.is_empty() {
                    yield LlmEvent::ToolCalls(calls);
                }
            }
        };

        stream.boxed()
    }
}

/// Accumulates `tool_calls` streaming deltas keyed by `index` until the
/// round ends. Argument fragments concatenate in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: ApiToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            if !id.is_empty() {
                entry.id = id;
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                if !name.is_empty() {
                    entry.name = name;
                }
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Consolidated calls in index order.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_values()
            .map(|c| ToolCallRequest {
                id: c.id,
                name: c.name,
                arguments: if c.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
            .collect()
    }
}

// Wire types for the chat-completions dialect.

#[derive(Debug, Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiAssistantToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiAssistantToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: ApiCallFunction,
}

#[derive(Debug, Serialize)]
struct ApiCallFunction {
    name: String,
    arguments: String,
}

impl From<&ChatMessage> for ApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: msg.content.clone(),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| ApiAssistantToolCall {
                        id: c.id.clone(),
                        kind: "function".to_string(),
                        function: ApiCallFunction {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    delta: Option<ApiDelta>,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCallDelta>>,
}

/// One streamed fragment of a tool call.
#[derive(Debug, Deserialize)]
pub struct ApiToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ApiToolFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct ApiToolFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}
