//! The per-call session loop.
//!
//! Consumes transport audio, runs the VAD gate inline, keeps the recognizer
//! fed, and drives the turn state machine off speech edges: an utterance
//! end spawns a turn task, a speech start during playback cancels it.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use voice_broker_core::AgentProfile;
use voice_broker_pipeline::{
    MediaBridge, PlaybackSink, SttDriver, SttDriverConfig, SttFeed, SttTranscripts, VadConfig,
    VadEdge, VadGate,
};

use crate::conversation::Conversation;
use crate::events::SessionEvent;
use crate::services::Services;
use crate::turn::{run_turn, StateCell, TurnConfig, TurnContext, TurnOutcome, TurnState};
use crate::SessionError;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub vad: VadConfig,
    pub stt: SttDriverConfig,
    pub turn: TurnConfig,
    /// Inbound buffer between transport and the gate, in milliseconds.
    pub inbound_buffer_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            stt: SttDriverConfig::default(),
            turn: TurnConfig::default(),
            inbound_buffer_ms: 60,
        }
    }
}

/// Control messages for a running session.
enum SessionControl {
    /// Abandon the current turn or pending transcript.
    CancelTurn,
}

struct TurnHandle {
    join: JoinHandle<TurnOutcome>,
    cancel: CancellationToken,
}

/// One live call.
pub struct Session {
    id: String,
    agent: Arc<AgentProfile>,
    services: Arc<Services>,
    conversation: Arc<Conversation>,
    bridge: Arc<MediaBridge>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<StateCell>,
    control_tx: mpsc::UnboundedSender<SessionControl>,
    control_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SessionControl>>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        agent: Arc<AgentProfile>,
        services: Arc<Services>,
        conversation: Arc<Conversation>,
        sink: Arc<dyn PlaybackSink>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            agent,
            services,
            conversation,
            bridge: Arc::new(MediaBridge::new(sink)),
            config,
            state: Arc::new(StateCell::new(events.clone())),
            events,
            control_tx,
            control_rx: parking_lot::Mutex::new(Some(control_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state.get()
    }

    /// Bounded inbound audio channel sized for this session.
    pub fn audio_channel(&self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        MediaBridge::inbound_channel(self.config.inbound_buffer_ms)
    }

    /// Ask the session to abandon the in-flight turn (or the pending
    /// transcript while listening).
    pub fn cancel_turn(&self) {
        let _ = self.control_tx.send(SessionControl::CancelTurn);
    }

    /// Drive the session until the transport closes or shutdown fires.
    pub async fn run(
        &self,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .expect("session can only run once");

        let mut gate = VadGate::with_energy_detector(self.config.vad.clone());
        let stt_driver = SttDriver::new(self.services.stt.clone(), self.config.stt.clone());
        let mut stt: Option<(SttFeed, SttTranscripts)> = None;

        let mut pending_finals: Vec<String> = Vec::new();
        let mut turn: Option<TurnHandle> = None;

        tracing::info!(session = %self.id, agent = %self.agent.name, "session started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                chunk = audio_rx.recv() => match chunk {
                    None => break,
                    Some(pcm) => {
                        if stt.is_none() {
                            // Lazy recognizer session on the first frame.
                            match stt_driver.open().await {
                                Ok(halves) => stt = Some(halves),
                                Err(e) => {
                                    let message = e.to_string();
                                    let _ = self.events.send(SessionEvent::TurnError(message.clone()));
                                    self.abort_turn(&mut turn).await;
                                    return Err(SessionError::SttUnavailable(message));
                                }
                            }
                        }
                        if let Some((feed, _)) = stt.as_mut() {
                            if let Err(e) = feed.send(&pcm).await {
                                tracing::warn!(error = %e, "failed to forward audio to stt");
                            }
                        }

                        for edge in gate.push(&pcm) {
                            self.handle_edge(edge, &mut turn, &mut pending_finals, &mut stt).await;
                        }
                    }
                },

                message = async { stt.as_mut().unwrap().1.recv().await }, if stt.is_some() => {
                    match message {
                        Some(transcript) => self.note_transcript(transcript, &mut pending_finals),
                        None => {
                            tracing::warn!(session = %self.id, "stt stream ended");
                            stt = None;
                        }
                    }
                },

                outcome = async { (&mut turn.as_mut().unwrap().join).await }, if turn.is_some() => {
                    turn = None;
                    self.handle_outcome(outcome);
                },

                control = control_rx.recv() => match control {
                    Some(SessionControl::CancelTurn) => {
                        if let Some(handle) = turn.as_ref() {
                            handle.cancel.cancel();
                        } else {
                            // Listening with nothing in flight: drop the
                            // pending transcript and go idle.
                            pending_finals.clear();
                            self.state.set(TurnState::Idle);
                        }
                    }
                    None => {}
                },
            }
        }

        // Orderly shutdown: cancel the turn, flush and close the recognizer.
        self.abort_turn(&mut turn).await;
        if let Some((mut feed, mut transcripts)) = stt.take() {
            let _ = feed.finish().await;
            let _ = transcripts.drain().await;
            let _ = feed.close(true).await;
        }
        tracing::info!(session = %self.id, "session ended");
        Ok(())
    }

    async fn handle_edge(
        &self,
        edge: VadEdge,
        turn: &mut Option<TurnHandle>,
        pending_finals: &mut Vec<String>,
        stt: &mut Option<(SttFeed, SttTranscripts)>,
    ) {
        match (edge, self.state.get()) {
            (VadEdge::SpeechStarted, TurnState::Idle) => {
                pending_finals.clear();
                self.state.set(TurnState::Listening);
            }
            (VadEdge::SpeechStarted, TurnState::Speaking) => {
                // Barge-in: cancel the whole turn. The turn task reports
                // back as Cancelled, which moves us to Listening.
                tracing::info!(session = %self.id, "barge-in detected");
                let _ = self.events.send(SessionEvent::BargeIn);
                self.state.set(TurnState::Interrupted);
                if let Some(handle) = turn.as_ref() {
                    handle.cancel.cancel();
                }
            }
            (VadEdge::SpeechEnded, TurnState::Listening) => {
                if turn.is_some() {
                    return;
                }
                // Give the recognizer a moment to deliver the utterance's
                // final transcript before deciding the turn is empty.
                if pending_finals.is_empty() {
                    if let Some((_, transcripts)) = stt.as_mut() {
                        self.await_final(transcripts, pending_finals).await;
                    }
                }

                let utterance = pending_finals.join(" ").trim().to_string();
                pending_finals.clear();
                if utterance.is_empty() {
                    tracing::debug!(session = %self.id, "empty transcript, no turn");
                    self.state.set(TurnState::Idle);
                    return;
                }

                self.state.set(TurnState::Thinking);
                *turn = Some(self.spawn_turn(utterance));
            }
            _ => {}
        }
    }

    async fn await_final(
        &self,
        transcripts: &mut SttTranscripts,
        pending_finals: &mut Vec<String>,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.stt.drain_timeout;
        while pending_finals.is_empty() {
            match tokio::time::timeout_at(deadline, transcripts.recv()).await {
                Ok(Some(transcript)) => self.note_transcript(transcript, pending_finals),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn note_transcript(
        &self,
        transcript: voice_broker_core::Transcript,
        pending_finals: &mut Vec<String>,
    ) {
        if transcript.is_final {
            if !transcript.text.trim().is_empty() {
                pending_finals.push(transcript.text.clone());
            }
            let _ = self.events.send(SessionEvent::FinalTranscript(transcript));
        } else {
            let _ = self.events.send(SessionEvent::PartialTranscript(transcript));
        }
    }

    fn spawn_turn(&self, utterance: String) -> TurnHandle {
        let cancel = CancellationToken::new();
        let ctx = TurnContext {
            conversation: self.conversation.clone(),
            services: self.services.clone(),
            bridge: self.bridge.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            cancel: cancel.clone(),
            config: self.config.turn.clone(),
            base_prompt: self.agent.system_prompt.clone(),
            utterance,
        };
        TurnHandle {
            join: tokio::spawn(run_turn(ctx)),
            cancel,
        }
    }

    fn handle_outcome(&self, outcome: Result<TurnOutcome, tokio::task::JoinError>) {
        match outcome {
            Ok(TurnOutcome::Completed { text }) => {
                tracing::info!(session = %self.id, chars = text.len(), "turn committed");
                self.state.set(TurnState::Idle);
            }
            Ok(TurnOutcome::Cancelled) => {
                tracing::info!(session = %self.id, "turn cancelled, listening again");
                self.state.set(TurnState::Listening);
            }
            Ok(TurnOutcome::Failed(message)) => {
                tracing::warn!(session = %self.id, error = %message, "turn failed");
                self.state.set(TurnState::Idle);
            }
            Err(e) => {
                let message = format!("turn task panicked: {e}");
                let _ = self.events.send(SessionEvent::TurnError(message));
                self.state.set(TurnState::Idle);
            }
        }
    }

    async fn abort_turn(&self, turn: &mut Option<TurnHandle>) {
        if let Some(handle) = turn.take() {
            handle.cancel.cancel();
            let grace = self.config.turn.cancel_grace * 4;
            match tokio::time::timeout(grace, handle.join).await {
                Ok(outcome) => self.handle_outcome(outcome),
                Err(_) => tracing::warn!(session = %self.id, "turn did not stop within grace"),
            }
        }
    }
}

/// Convenience for embedding applications and tests: run a session on a
/// fresh task and get its handle back.
pub fn spawn_session(
    session: Arc<Session>,
    audio_rx: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), SessionError>> {
    tokio::spawn(async move { session.run(audio_rx, shutdown).await })
}

