//! Scripted providers and a session harness for end-to-end turn tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voice_broker_core::{
    AgentProfile, AudioSink, ChatRequest, LanguageModel, LlmEvent, LlmStream, PcmSource,
    ProviderError, ProviderSelection, SpeechToText, SttMessage, TextToSpeech, ToolBinding,
    TranscriptSource, Transcript, TtsSink,
};
use voice_broker_pipeline::{PipelineError, PlaybackSink};
use voice_broker_rag::{Embedder, HashEmbedder, MemoryIndex, Retriever, RetrieverConfig, VectorIndex, VectorPoint};
use voice_broker_session::{
    Conversation, ConversationStore, Services, Session, SessionConfig, SessionError, SessionEvent,
};
use voice_broker_tools::{
    ExecutorConfig, IntegrationResolver, SessionToolExecutor, ToolIntegration,
};

pub const FRAME_BYTES: usize = 960;

// ---------------------------------------------------------------------------
// Scripted STT: the test injects transcripts directly.
// ---------------------------------------------------------------------------

pub struct ScriptedStt {
    source: Mutex<Option<mpsc::UnboundedReceiver<SttMessage>>>,
}

pub fn scripted_stt() -> (Arc<ScriptedStt>, mpsc::UnboundedSender<SttMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedStt {
            source: Mutex::new(Some(rx)),
        }),
        tx,
    )
}

struct DiscardingAudioSink;

#[async_trait]
impl AudioSink for DiscardingAudioSink {
    async fn send_audio(&mut self, _pcm: &[u8]) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn close(&mut self, _graceful: bool) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct ChannelTranscripts {
    rx: mpsc::UnboundedReceiver<SttMessage>,
}

#[async_trait]
impl TranscriptSource for ChannelTranscripts {
    async fn recv(&mut self) -> Result<Option<SttMessage>, ProviderError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn open(
        &self,
    ) -> Result<(Box<dyn AudioSink>, Box<dyn TranscriptSource>), ProviderError> {
        let rx = self
            .source
            .lock()
            .take()
            .ok_or_else(|| ProviderError::Connect("stt already open".into()))?;
        Ok((
            Box::new(DiscardingAudioSink),
            Box::new(ChannelTranscripts { rx }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM: one script per round, recorded requests.
// ---------------------------------------------------------------------------

pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LlmEvent>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub token_delay: Duration,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<LlmEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
        })
    }

    pub fn with_delay(scripts: Vec<Vec<LlmEvent>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            token_delay: delay,
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl LanguageModel for ScriptedLlm {
    fn stream(&self, request: ChatRequest) -> LlmStream {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let delay = self.token_delay;
        Box::pin(async_stream::stream! {
            for event in script {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(event);
            }
        })
    }
}

pub fn token(text: &str) -> LlmEvent {
    LlmEvent::Token(text.to_string())
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> LlmEvent {
    LlmEvent::ToolCalls(vec![voice_broker_core::ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }])
}

// ---------------------------------------------------------------------------
// Scripted TTS: each segment becomes one PCM chunk.
// ---------------------------------------------------------------------------

pub struct ScriptedTts {
    pub chunk_bytes: usize,
    pub synth_delay: Duration,
    pub fail_synthesis: bool,
    pub aborted: Arc<AtomicBool>,
}

impl ScriptedTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunk_bytes: 640,
            synth_delay: Duration::ZERO,
            fail_synthesis: false,
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunk_bytes: 640,
            synth_delay: delay,
            fail_synthesis: false,
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            chunk_bytes: 640,
            synth_delay: Duration::ZERO,
            fail_synthesis: true,
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct ScriptedTtsSink {
    tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    chunk_bytes: usize,
    synth_delay: Duration,
    fail: bool,
    aborted: Arc<AtomicBool>,
}

#[async_trait]
impl TtsSink for ScriptedTtsSink {
    async fn send_text(&mut self, _text: &str) -> Result<(), ProviderError> {
        if self.fail {
            return Err(ProviderError::Transport("synthesis rejected".into()));
        }
        if self.synth_delay > Duration::ZERO {
            tokio::time::sleep(self.synth_delay).await;
        }
        let _ = self.tx.send(Some(vec![0x5A; self.chunk_bytes]));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ProviderError> {
        let _ = self.tx.send(None);
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), ProviderError> {
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.tx.send(None);
        Ok(())
    }
}

struct ScriptedTtsSource {
    rx: mpsc::UnboundedReceiver<Option<Vec<u8>>>,
}

#[async_trait]
impl PcmSource for ScriptedTtsSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ProviderError> {
        match self.rx.recv().await {
            Some(Some(pcm)) => Ok(Some(pcm)),
            Some(None) | None => Ok(None),
        }
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    async fn open(&self) -> Result<(Box<dyn TtsSink>, Box<dyn PcmSource>), ProviderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Box::new(ScriptedTtsSink {
                tx,
                chunk_bytes: self.chunk_bytes,
                synth_delay: self.synth_delay,
                fail: self.fail_synthesis,
                aborted: self.aborted.clone(),
            }),
            Box::new(ScriptedTtsSource { rx }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Collecting playback sink.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CollectingSink {
    pub sample_rate: Mutex<Option<u32>>,
    pub chunks: Mutex<Vec<Vec<u8>>>,
    pub discards: AtomicUsize,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

#[async_trait]
impl PlaybackSink for CollectingSink {
    async fn begin(&self, sample_rate: u32) -> Result<(), PipelineError> {
        *self.sample_rate.lock() = Some(sample_rate);
        Ok(())
    }

    async fn play(&self, pcm: Vec<u8>) -> Result<(), PipelineError> {
        self.chunks.lock().push(pcm);
        Ok(())
    }

    async fn discard(&self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Audio helpers.
// ---------------------------------------------------------------------------

/// `n` frames of loud audio (square-ish wave, well above the energy floor).
pub fn loud_frames(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|_| {
            let mut frame = Vec::with_capacity(FRAME_BYTES);
            for i in 0..(FRAME_BYTES / 2) {
                let sample: i16 = if i % 2 == 0 { 12_000 } else { -12_000 };
                frame.extend_from_slice(&sample.to_le_bytes());
            }
            frame
        })
        .collect()
}

pub fn silence_frames(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|_| vec![0u8; FRAME_BYTES]).collect()
}

// ---------------------------------------------------------------------------
// Harness.
// ---------------------------------------------------------------------------

pub struct HarnessOptions {
    pub llm: Arc<ScriptedLlm>,
    pub tts: Arc<ScriptedTts>,
    pub tool_bindings: Vec<(&'static str, &'static str)>,
    pub tool_resolver: Option<IntegrationResolver>,
    pub rag_products: Vec<&'static str>,
}

impl HarnessOptions {
    pub fn with_llm(llm: Arc<ScriptedLlm>) -> Self {
        Self {
            llm,
            tts: ScriptedTts::new(),
            tool_bindings: Vec::new(),
            tool_resolver: None,
            rag_products: Vec::new(),
        }
    }
}

pub struct Harness {
    pub session: Arc<Session>,
    pub conversation: Arc<Conversation>,
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    pub stt_tx: mpsc::UnboundedSender<SttMessage>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub sink: Arc<CollectingSink>,
    pub llm: Arc<ScriptedLlm>,
    pub shutdown: CancellationToken,
    pub join: JoinHandle<Result<(), SessionError>>,
}

impl Harness {
    pub async fn start(options: HarnessOptions) -> Self {
        let agent_id = Uuid::new_v4();
        let agent = Arc::new(AgentProfile {
            id: agent_id,
            name: "shop-assistant".into(),
            system_prompt: "You are a helpful shop assistant.".into(),
            stt: ProviderSelection::new("mock", serde_json::json!({})),
            llm: ProviderSelection::new("mock", serde_json::json!({})),
            tts: ProviderSelection::new("mock", serde_json::json!({})),
            tools: options
                .tool_bindings
                .iter()
                .map(|(tool, integration)| ToolBinding {
                    id: Uuid::new_v4(),
                    agent_id,
                    tool_slug: tool.to_string(),
                    integration_slug: integration.to_string(),
                    integration_config: serde_json::json!({}),
                    enabled: true,
                })
                .collect(),
            rag: None,
        });

        let (stt, stt_tx) = scripted_stt();

        let retriever = if options.rag_products.is_empty() {
            None
        } else {
            let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
            let index: Arc<dyn VectorIndex> = Arc::new(MemoryIndex::new());
            index.ensure_collection("kb", 32).await.unwrap();
            for (i, text) in options.rag_products.iter().enumerate() {
                let vector = embedder.embed(&[text.to_string()]).await.unwrap().remove(0);
                let mut payload = std::collections::HashMap::new();
                payload.insert("text".to_string(), text.to_string());
                index
                    .upsert(
                        "kb",
                        vec![VectorPoint {
                            id: format!("p{i}"),
                            vector,
                            payload,
                        }],
                    )
                    .await
                    .unwrap();
            }
            Some(Arc::new(Retriever::new(
                embedder,
                index,
                RetrieverConfig::new("kb"),
            )))
        };

        let tools = match options.tool_resolver {
            Some(resolver) => Arc::new(SessionToolExecutor::with_resolver(
                &agent,
                resolver,
                ExecutorConfig::default(),
            )),
            None => Arc::new(SessionToolExecutor::for_agent(&agent)),
        };

        let services = Arc::new(Services::new(
            stt,
            options.llm.clone(),
            options.tts.clone(),
            retriever,
            tools,
        ));

        let store = ConversationStore::new(16);
        let conversation = store.get_or_create("test-conversation");
        let sink = CollectingSink::new();

        let mut config = SessionConfig::default();
        config.stt.drain_timeout = Duration::from_millis(150);
        config.turn.first_token_timeout = Duration::from_secs(2);
        config.turn.cancel_grace = Duration::from_millis(100);

        let session = Arc::new(Session::new(
            "test-session",
            agent,
            services,
            conversation.clone(),
            sink.clone() as Arc<dyn PlaybackSink>,
            config,
        ));

        let events = session.subscribe();
        let (audio_tx, audio_rx) = session.audio_channel();
        let shutdown = CancellationToken::new();
        let join = voice_broker_session::session::spawn_session(
            session.clone(),
            audio_rx,
            shutdown.clone(),
        );

        Self {
            session,
            conversation,
            audio_tx,
            stt_tx,
            events,
            sink,
            llm: options.llm,
            shutdown,
            join,
        }
    }

    pub async fn send_frames(&self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            self.audio_tx.send(frame).await.expect("session closed");
        }
    }

    /// Speak one utterance: speech audio, a final transcript, then silence.
    pub async fn say(&mut self, text: &str) {
        self.send_frames(loud_frames(12)).await;
        self.stt_tx
            .send(SttMessage::Transcript(Transcript::final_text(text)))
            .unwrap();
        self.send_frames(silence_frames(20)).await;
    }

    pub async fn wait_for<F>(&mut self, what: &str, budget: Duration, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) => {
                    if pred(&event) {
                        return event;
                    }
                }
                Ok(Err(_)) => panic!("event channel closed waiting for {what}"),
                Err(_) => panic!("timed out waiting for {what}"),
            }
        }
    }

    pub async fn finish(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }
}

/// Resolver that hands every binding the same scripted integration.
pub fn fixed_resolver(integration: Arc<dyn ToolIntegration>) -> IntegrationResolver {
    Arc::new(move |_binding: &ToolBinding| Ok(integration.clone()))
}
