//! LLM driver for the voice broker.
//!
//! One backend speaks the chat-completions streaming dialect used by
//! OpenAI-compatible endpoints; the factory maps an agent's provider tag to
//! a configured backend through a static table rather than any dynamic
//! lookup.

pub mod backend;
pub mod factory;

pub use backend::{OpenAiBackend, OpenAiConfig, ToolCallAccumulator};
pub use factory::create_language_model;
