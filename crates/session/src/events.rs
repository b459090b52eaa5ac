//! Session events.
//!
//! Everything observable about a session flows through one broadcast
//! channel: transcripts, response text deltas, playback lifecycle, barge-in
//! and errors. The transport layer and any monitoring consumers subscribe;
//! a lagging subscriber never blocks the pipeline.

use voice_broker_core::Transcript;

use crate::turn::TurnState;

/// Events published on a session's broadcast channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Turn state machine moved.
    StateChanged(TurnState),
    /// Recognizer hypothesis, not yet final.
    PartialTranscript(Transcript),
    /// Final recognizer result for (part of) an utterance.
    FinalTranscript(Transcript),
    /// Assistant text so far this turn; `is_final` marks the commit.
    Response { text: String, is_final: bool },
    /// Synthesis began; the outbound stream runs at this rate.
    PlaybackStarted { sample_rate: u32 },
    /// User started speaking over the assistant; the turn is cancelling.
    BargeIn,
    /// The turn failed; the conversation log was left clean.
    TurnError(String),
}
