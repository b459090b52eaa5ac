//! Audio pipeline for the voice broker.
//!
//! Owns the session-side timing of the four streaming peers: the VAD gate
//! frames inbound PCM and emits speech edges, the STT driver multiplexes a
//! provider recognizer session, the TTS driver segments assistant text and
//! applies playback back-pressure, and the media bridge adapts transport
//! chunks on both ends.

pub mod bridge;
pub mod stt;
pub mod tts;
pub mod vad;

use std::time::Duration;

use thiserror::Error;
use voice_broker_core::ProviderError;

/// Pipeline errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stt unavailable: {0}")]
    SttUnavailable(ProviderError),

    #[error("stt error: {0}")]
    Stt(ProviderError),

    #[error("tts error: {0}")]
    Tts(ProviderError),

    #[error("tts produced no audio within {0:?}")]
    TtsFirstByteTimeout(Duration),

    #[error("playback sink error: {0}")]
    Playback(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("cancelled")]
    Cancelled,
}

pub use bridge::{MediaBridge, PlaybackSink};
pub use stt::{SttDriver, SttDriverConfig, SttFeed, SttTranscripts};
pub use tts::{SentenceSegmenter, TtsDriver, TtsDriverConfig, TtsStream};
pub use vad::{EnergyDetector, VadConfig, VadEdge, VadGate, VadState, VoiceDetector};
