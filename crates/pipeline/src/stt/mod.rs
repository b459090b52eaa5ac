//! STT driver.
//!
//! Wraps a provider recognizer session behind a uniform shape: the session
//! opens lazily with a hard connect timeout, audio is forwarded exactly as it
//! arrived, and a background receive task queues transcripts so a slow
//! consumer can never stall the audio sender. Non-transcript control
//! messages from the provider are tolerated silently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use voice_broker_core::{ProviderError, SpeechToText, SttMessage, Transcript};

use crate::PipelineError;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct SttDriverConfig {
    /// Initial connect budget; exceeding it is fatal for the turn.
    pub connect_timeout: Duration,
    /// How long to wait for stragglers after the flush signal.
    pub drain_timeout: Duration,
    /// Transcript queue depth between the receive task and the consumer.
    pub queue_capacity: usize,
}

impl Default for SttDriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            queue_capacity: 32,
        }
    }
}

/// Factory for recognizer sessions against one provider.
pub struct SttDriver {
    provider: Arc<dyn SpeechToText>,
    config: SttDriverConfig,
}

impl SttDriver {
    pub fn new(provider: Arc<dyn SpeechToText>, config: SttDriverConfig) -> Self {
        Self { provider, config }
    }

    /// Open the provider session. Returns the audio feed and the transcript
    /// queue as separate halves so they can live in separate tasks.
    pub async fn open(&self) -> Result<(SttFeed, SttTranscripts), PipelineError> {
        let opened = timeout(self.config.connect_timeout, self.provider.open())
            .await
            .map_err(|_| {
                PipelineError::SttUnavailable(ProviderError::Timeout(self.config.connect_timeout))
            })?
            .map_err(PipelineError::SttUnavailable)?;
        let (sink, mut source) = opened;

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let recv_task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(Some(SttMessage::Transcript(t))) => {
                        if tx.send(t).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(SttMessage::Control(ctrl))) => {
                        tracing::trace!(?ctrl, "stt control message");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stt receive error, ending stream");
                        break;
                    }
                }
            }
        });

        Ok((
            SttFeed { sink },
            SttTranscripts {
                rx,
                recv_task,
                drain_timeout: self.config.drain_timeout,
            },
        ))
    }
}

/// Send half: forwards PCM as-is and signals end-of-audio.
pub struct SttFeed {
    sink: Box<dyn voice_broker_core::AudioSink>,
}

impl SttFeed {
    pub async fn send(&mut self, pcm: &[u8]) -> Result<(), PipelineError> {
        self.sink.send_audio(pcm).await.map_err(PipelineError::Stt)
    }

    /// Send the provider-appropriate flush signal.
    pub async fn finish(&mut self) -> Result<(), PipelineError> {
        self.sink.finish().await.map_err(PipelineError::Stt)
    }

    pub async fn close(&mut self, graceful: bool) -> Result<(), PipelineError> {
        self.sink.close(graceful).await.map_err(PipelineError::Stt)
    }
}

/// Receive half: the queued transcript stream.
pub struct SttTranscripts {
    rx: mpsc::Receiver<Transcript>,
    recv_task: JoinHandle<()>,
    drain_timeout: Duration,
}

impl SttTranscripts {
    /// Next transcript, or `None` once the provider stream has ended and the
    /// queue is empty.
    pub async fn recv(&mut self) -> Option<Transcript> {
        self.rx.recv().await
    }

    /// Collect outstanding transcripts after end-of-audio, up to the drain
    /// budget.
    pub async fn drain(&mut self) -> Vec<Transcript> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(t)) => out.push(t),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        out
    }
}

impl Drop for SttTranscripts {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
