//! Per-call session orchestration.
//!
//! A session wires the media bridge, VAD gate, STT driver, turn
//! orchestrator, and TTS driver together around one conversation. The
//! orchestrator owns the five-state turn machine; everything else is
//! plumbing between bounded channels with one cancellation token per turn.

pub mod conversation;
pub mod events;
pub mod services;
pub mod session;
pub mod store;
pub mod turn;

use thiserror::Error;

use voice_broker_core::LlmError;
use voice_broker_pipeline::PipelineError;

/// Session-level errors. Turn-level faults stay inside the turn and
/// surface as events; these end the session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("stt unavailable: {0}")]
    SttUnavailable(String),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("llm configuration error: {0}")]
    Llm(#[from] LlmError),
}

pub use conversation::Conversation;
pub use events::SessionEvent;
pub use services::Services;
pub use session::{Session, SessionConfig};
pub use store::ConversationStore;
pub use turn::{TurnConfig, TurnState};
