//! Media bridge.
//!
//! Adapts transport audio to and from the session. Inbound chunks flow
//! through a small bounded channel into the VAD gate and recognizer;
//! outbound PCM from the TTS driver is forwarded to the transport's playback
//! sink in FIFO order. Some synthesizer transports prepend a WAV header to
//! their byte stream; the bridge strips it, since the playback contract is
//! raw PCM. Cancellation discards everything queued so no audio leaks after
//! a barge-in.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::tts::TtsStream;
use crate::PipelineError;
use voice_broker_core::audio::bytes_per_ms;

/// Transport-side playback target.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Declared once per synthesis stream, before the first chunk.
    async fn begin(&self, sample_rate: u32) -> Result<(), PipelineError>;

    /// Enqueue one PCM chunk for playback.
    async fn play(&self, pcm: Vec<u8>) -> Result<(), PipelineError>;

    /// Drop whatever the transport still has queued.
    async fn discard(&self);
}

const WAV_HEADER_LEN: usize = 44;

fn strip_wav_header(chunk: Vec<u8>) -> Vec<u8> {
    if chunk.len() >= WAV_HEADER_LEN && &chunk[..4] == b"RIFF" && &chunk[8..12] == b"WAVE" {
        return chunk[WAV_HEADER_LEN..].to_vec();
    }
    chunk
}

/// The bridge owns the playback sink for one session.
pub struct MediaBridge {
    sink: std::sync::Arc<dyn PlaybackSink>,
}

impl MediaBridge {
    pub fn new(sink: std::sync::Arc<dyn PlaybackSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &std::sync::Arc<dyn PlaybackSink> {
        &self.sink
    }

    /// Bounded inbound channel sized for roughly `buffer_ms` of audio in
    /// 30 ms transport chunks.
    pub fn inbound_channel(
        buffer_ms: u32,
    ) -> (
        tokio::sync::mpsc::Sender<Vec<u8>>,
        tokio::sync::mpsc::Receiver<Vec<u8>>,
    ) {
        let capacity = (buffer_ms / 30).max(1) as usize;
        tokio::sync::mpsc::channel(capacity)
    }

    /// Forward a synthesis stream to the transport until it ends or the
    /// token cancels. On cancellation, queued audio is discarded, the sink
    /// is told to drop its own queue, and the driver is given `grace` to
    /// wind down.
    pub async fn play_stream(
        &self,
        mut stream: TtsStream,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<(), PipelineError> {
        self.sink.begin(stream.sample_rate).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.sink.discard().await;
                    let _ = tokio::time::timeout(grace, stream.join()).await;
                    return Err(PipelineError::Cancelled);
                }
                chunk = stream.recv() => match chunk {
                    Some(pcm) => {
                        let pcm = strip_wav_header(pcm);
                        if !pcm.is_empty() {
                            self.sink.play(pcm).await?;
                        }
                    }
                    None => break,
                },
            }
        }

        stream.join().await
    }
}

/// Sizing helper for outbound buffering: bytes of PCM covering `ms` at the
/// stream's rate.
pub fn outbound_buffer_bytes(sample_rate: u32, ms: u32) -> usize {
    bytes_per_ms(sample_rate, ms)
}
