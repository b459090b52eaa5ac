//! Core traits and types for the voice broker
//!
//! This crate provides the foundational types used across all other crates:
//! - Conversation messages and roles
//! - Agent profiles and provider selections
//! - Provider adapter traits (STT, TTS, LLM)
//! - Audio constants for the inbound media contract
//! - Shared error types

pub mod agent;
pub mod audio;
pub mod conversation;
pub mod error;
pub mod traits;

pub use agent::{AgentProfile, ProviderSelection, RagSettings, ToolBinding};
pub use audio::{bytes_per_ms, BYTES_PER_SAMPLE, INBOUND_SAMPLE_RATE};
pub use conversation::{ChatMessage, Role, ToolCallRequest};
pub use error::{LlmError, ProviderError};
pub use traits::{
    AudioSink, ChatRequest, LanguageModel, LlmEvent, LlmStream, PcmSource, SpeechToText,
    SttControl, SttMessage, TextToSpeech, ToolSpec, Transcript, TranscriptSource, TtsSink,
};
