//! Provider adapter traits.
//!
//! Every external streaming service sits behind one of these uniform
//! contracts. Concrete shims are selected per agent through a compile-time
//! factory; drivers in the pipeline crate own timing, buffering and
//! cancellation and stay provider-agnostic.

mod llm;
mod speech;

pub use llm::{ChatRequest, LanguageModel, LlmEvent, LlmStream, ToolSpec};
pub use speech::{
    AudioSink, PcmSource, SpeechToText, SttControl, SttMessage, TextToSpeech, Transcript,
    TranscriptSource, TtsSink,
};
