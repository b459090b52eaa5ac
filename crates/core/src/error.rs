//! Shared error types for provider adapters.
//!
//! The taxonomy distinguishes transient faults (worth surfacing to the
//! orchestrator, which aborts the turn) from fatal ones (misconfiguration or
//! auth, which abort the session). Drivers never retry; upper layers may.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by STT and TTS adapter sessions.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed provider message. The driver terminates the turn as if the
    /// provider ended.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Auth failure or misconfiguration. Aborts the session.
    #[error("fatal provider error: {0}")]
    Fatal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal(_))
    }
}

/// Errors produced by the LLM driver.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out waiting for first token")]
    FirstTokenTimeout,

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether a caller above the orchestrator could reasonably retry.
    /// The orchestrator itself never retries.
    pub fn retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::FirstTokenTimeout => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
