//! TTS driver.
//!
//! Consumes a stream of text fragments, segments them for prosody, and
//! yields PCM chunks in strict FIFO order. The provider session opens
//! lazily on the first fragment. Output flows through a bounded channel
//! holding roughly 200 ms of audio, so a slow playback consumer exerts
//! back-pressure on synthesis. Cancellation sends the provider stop signal
//! and discards everything still in flight.

mod segment;

pub use segment::{SegmenterConfig, SentenceSegmenter};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use voice_broker_core::{PcmSource, TextToSpeech, TtsSink};

use crate::PipelineError;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct TtsDriverConfig {
    pub segmenter: SegmenterConfig,
    /// Budget for the first audio byte after text was sent; fatal.
    pub first_byte_timeout: Duration,
    /// Target depth of the output channel, in milliseconds of audio.
    pub buffer_ms: u32,
    /// Assumed provider chunk duration, used to size the channel.
    pub chunk_hint_ms: u32,
}

impl Default for TtsDriverConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            first_byte_timeout: Duration::from_secs(3),
            buffer_ms: 200,
            chunk_hint_ms: 20,
        }
    }
}

/// A running synthesis stream.
pub struct TtsStream {
    /// Sample rate declared by the provider for this stream.
    pub sample_rate: u32,
    audio: mpsc::Receiver<Vec<u8>>,
    handle: JoinHandle<Result<(), PipelineError>>,
}

impl TtsStream {
    /// Next PCM chunk in FIFO order; `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.audio.recv().await
    }

    /// Wait for the driver tasks to wind down and surface their outcome.
    pub async fn join(self) -> Result<(), PipelineError> {
        drop(self.audio);
        match self.handle.await {
            Ok(res) => res,
            Err(e) => Err(PipelineError::Playback(format!("tts task panicked: {e}"))),
        }
    }
}

/// Factory for synthesis streams against one provider.
pub struct TtsDriver {
    provider: Arc<dyn TextToSpeech>,
    config: TtsDriverConfig,
}

impl TtsDriver {
    pub fn new(provider: Arc<dyn TextToSpeech>, config: TtsDriverConfig) -> Self {
        Self { provider, config }
    }

    /// Start synthesizing the text arriving on `text_rx`. Closing the
    /// channel flushes the tail segment and ends the stream; cancelling the
    /// token aborts the provider and discards queued audio.
    pub fn start(&self, text_rx: mpsc::Receiver<String>, cancel: CancellationToken) -> TtsStream {
        let capacity = (self.config.buffer_ms / self.config.chunk_hint_ms).max(1) as usize;
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let provider = self.provider.clone();
        let config = self.config.clone();
        let sample_rate = provider.sample_rate();

        let handle = tokio::spawn(run_stream(provider, config, text_rx, audio_tx, cancel));

        TtsStream {
            sample_rate,
            audio: audio_rx,
            handle,
        }
    }
}

async fn run_stream(
    provider: Arc<dyn TextToSpeech>,
    config: TtsDriverConfig,
    mut text_rx: mpsc::Receiver<String>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    // Lazy establishment: nothing happens until the first fragment.
    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        first = text_rx.recv() => match first {
            Some(t) => t,
            None => return Ok(()),
        },
    };

    let (sink, source) = provider.open().await.map_err(PipelineError::Tts)?;

    let (first_sent_tx, first_sent_rx) = oneshot::channel();
    let pump = tokio::spawn(pump_audio(
        source,
        audio_tx,
        cancel.clone(),
        first_sent_rx,
        config.first_byte_timeout,
    ));

    let send_result = send_text(
        sink,
        &config,
        first,
        &mut text_rx,
        cancel.clone(),
        first_sent_tx,
    )
    .await;

    let pump_result = match pump.await {
        Ok(res) => res,
        Err(e) => Err(PipelineError::Playback(format!("tts pump panicked: {e}"))),
    };

    send_result?;
    pump_result
}

async fn send_text(
    mut sink: Box<dyn TtsSink>,
    config: &TtsDriverConfig,
    first: String,
    text_rx: &mut mpsc::Receiver<String>,
    cancel: CancellationToken,
    first_sent_tx: oneshot::Sender<()>,
) -> Result<(), PipelineError> {
    let mut segmenter = SentenceSegmenter::new(config.segmenter.clone());
    let mut first_sent = Some(first_sent_tx);

    let mut mark_first = move || {
        if let Some(tx) = first_sent.take() {
            let _ = tx.send(());
        }
    };

    for segment in segmenter.push(&first) {
        mark_first();
        sink.send_text(&segment).await.map_err(PipelineError::Tts)?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.abort().await;
                return Err(PipelineError::Cancelled);
            }
            fragment = text_rx.recv() => match fragment {
                Some(text) => {
                    for segment in segmenter.push(&text) {
                        mark_first();
                        sink.send_text(&segment).await.map_err(PipelineError::Tts)?;
                    }
                }
                None => break,
            },
        }
    }

    if let Some(tail) = segmenter.flush() {
        mark_first();
        sink.send_text(&tail).await.map_err(PipelineError::Tts)?;
    }
    sink.finish().await.map_err(PipelineError::Tts)?;
    Ok(())
}

async fn pump_audio(
    mut source: Box<dyn PcmSource>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    first_sent: oneshot::Receiver<()>,
    first_byte_timeout: Duration,
) -> Result<(), PipelineError> {
    // Audio is only expected once text has been sent.
    tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        res = first_sent => {
            if res.is_err() {
                // Sender finished without ever sending text.
                return Ok(());
            }
        }
    }

    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        chunk = timeout(first_byte_timeout, source.next_chunk()) => match chunk {
            Err(_) => return Err(PipelineError::TtsFirstByteTimeout(first_byte_timeout)),
            Ok(res) => res.map_err(PipelineError::Tts)?,
        },
    };

    let Some(first) = first else { return Ok(()) };
    if audio_tx.send(first).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            chunk = source.next_chunk() => match chunk.map_err(PipelineError::Tts)? {
                Some(pcm) => {
                    if audio_tx.send(pcm).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
        }
    }
}
