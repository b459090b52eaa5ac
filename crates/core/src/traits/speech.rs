//! Speech provider contracts (STT and TTS).

use async_trait::async_trait;

use crate::error::ProviderError;

/// One recognizer hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
    pub language: Option<String>,
}

impl Transcript {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
            language: None,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
            language: None,
        }
    }
}

/// Non-transcript control messages some recognizers interleave into the
/// stream. The driver tolerates these silently.
#[derive(Debug, Clone)]
pub enum SttControl {
    SpeechEvent(String),
    Lifecycle(String),
}

/// A message received from a recognizer session.
#[derive(Debug, Clone)]
pub enum SttMessage {
    Transcript(Transcript),
    Control(SttControl),
}

/// Recognizer adapter. `open` establishes the provider session and returns
/// the send and receive halves so they can be driven from separate tasks.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn AudioSink>, Box<dyn TranscriptSource>), ProviderError>;
}

/// Send half of a recognizer session.
#[async_trait]
pub trait AudioSink: Send {
    /// Forward PCM exactly as it arrived; no reframing.
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), ProviderError>;

    /// Signal end-of-audio the provider-appropriate way.
    async fn finish(&mut self) -> Result<(), ProviderError>;

    async fn close(&mut self, graceful: bool) -> Result<(), ProviderError>;
}

/// Receive half of a recognizer session. `recv` returns `None` once the
/// provider stream ends.
#[async_trait]
pub trait TranscriptSource: Send {
    async fn recv(&mut self) -> Result<Option<SttMessage>, ProviderError>;
}

/// Synthesizer adapter. Text goes in via the sink, PCM comes out of the
/// source in FIFO order at the provider's native sample rate.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Native sample rate of synthesized audio, declared once per stream.
    fn sample_rate(&self) -> u32;

    async fn open(&self) -> Result<(Box<dyn TtsSink>, Box<dyn PcmSource>), ProviderError>;
}

/// Send half of a synthesizer session.
#[async_trait]
pub trait TtsSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError>;

    /// No more text will follow; the provider should flush remaining audio.
    async fn finish(&mut self) -> Result<(), ProviderError>;

    /// Stop synthesis immediately and close the provider session.
    async fn abort(&mut self) -> Result<(), ProviderError>;
}

/// Receive half of a synthesizer session. `next_chunk` returns `None` at
/// end of stream.
#[async_trait]
pub trait PcmSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError>;
}
