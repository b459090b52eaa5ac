//! Turn orchestration.
//!
//! A turn runs from a finalized user utterance to a committed assistant
//! message. The orchestrator streams model output into the synthesizer as
//! it arrives, executes tool rounds in between, and keeps the conversation
//! log clean under every failure mode: nothing a cancelled or failed turn
//! produced is ever committed.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use voice_broker_core::{ChatMessage, ChatRequest, LlmEvent, ToolCallRequest};
use voice_broker_pipeline::{MediaBridge, PipelineError, TtsDriver, TtsDriverConfig};
use voice_broker_rag::{build_rag_query, compose_system_prompt};

use crate::conversation::Conversation;
use crate::events::SessionEvent;
use crate::services::Services;

/// The session-visible turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
}

/// Turn configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Tool-round cap per turn. The counter is a plain round counter.
    pub max_rounds: usize,
    /// Conversation window sent to the model.
    pub history_window: usize,
    /// Budget for the model's first event each round; fatal.
    pub first_token_timeout: Duration,
    /// How long cancelled drivers get to wind down.
    pub cancel_grace: Duration,
    /// Spoken when the round cap is hit with no usable text.
    pub fallback_reply: String,
    pub tts: TtsDriverConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            history_window: 10,
            first_token_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_millis(200),
            fallback_reply: "Sorry, I couldn't complete that. Could you rephrase?".to_string(),
            tts: TtsDriverConfig::default(),
        }
    }
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Assistant message committed (possibly empty if nothing happened).
    Completed { text: String },
    /// Barge-in or external cancel; nothing committed.
    Cancelled,
    /// Driver failure; nothing committed, error already published.
    Failed(String),
}

/// Shared turn state cell; transitions publish `StateChanged`.
pub(crate) struct StateCell {
    state: parking_lot::Mutex<TurnState>,
    events: broadcast::Sender<SessionEvent>,
}

impl StateCell {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            state: parking_lot::Mutex::new(TurnState::Idle),
            events,
        }
    }

    pub fn set(&self, next: TurnState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "turn state changed");
            *state = next;
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    pub fn get(&self) -> TurnState {
        *self.state.lock()
    }
}

/// Everything one turn needs.
pub(crate) struct TurnContext {
    pub conversation: Arc<Conversation>,
    pub services: Arc<Services>,
    pub bridge: Arc<MediaBridge>,
    pub events: broadcast::Sender<SessionEvent>,
    pub state: Arc<StateCell>,
    pub cancel: CancellationToken,
    pub config: TurnConfig,
    pub base_prompt: String,
    pub utterance: String,
}

struct TtsParts {
    text_tx: mpsc::Sender<String>,
    playback: JoinHandle<Result<(), PipelineError>>,
    cancel: CancellationToken,
}

/// Run one turn to completion, cancellation, or failure.
pub(crate) async fn run_turn(ctx: TurnContext) -> TurnOutcome {
    // Exclusive right to this conversation for the whole turn.
    let _turn_gate = ctx.conversation.begin_turn().await;

    // The user message is committed immediately; everything else the turn
    // produces stays local until the final commit.
    ctx.conversation
        .append(ChatMessage::user(ctx.utterance.clone()))
        .await;

    let mut messages = build_window(&ctx).await;
    let tools = ctx.services.tools.tool_specs();

    // TTS failure surfaces through this watch; the sender half must outlive
    // the loop so `changed()` cannot spuriously resolve.
    let (tts_err_tx, mut tts_err_rx) = watch::channel(None::<String>);
    let mut turn_products: Vec<ChatMessage> = Vec::new();
    let mut tts: Option<TtsParts> = None;
    let mut final_text = String::new();
    let mut ended_with_text = false;

    'rounds: for round in 0..ctx.config.max_rounds {
        let request = ChatRequest::new(messages.clone()).with_tools(tools.clone());
        let mut stream = ctx.services.llm.stream(request);
        let first_event_deadline = tokio::time::Instant::now() + ctx.config.first_token_timeout;
        let mut awaiting_first = true;
        let mut round_text = String::new();
        let mut tool_calls: Option<Vec<ToolCallRequest>> = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    drop(stream);
                    return wind_down_cancelled(tts, ctx.config.cancel_grace).await;
                }
                _ = tokio::time::sleep_until(first_event_deadline), if awaiting_first => {
                    drop(stream);
                    return fail_turn(&ctx, tts, "llm produced no output in time".to_string()).await;
                }
                _ = tts_err_rx.changed() => {
                    let message = tts_err_rx.borrow().clone().unwrap_or_default();
                    drop(stream);
                    return fail_turn(&ctx, tts, format!("tts failed mid-turn: {message}")).await;
                }
                event = stream.next() => match event {
                    Some(Ok(LlmEvent::Token(token))) => {
                        awaiting_first = false;
                        round_text.push_str(&token);

                        if tts.is_none() {
                            tts = Some(start_tts(&ctx, tts_err_tx.clone()));
                        }
                        ctx.state.set(TurnState::Speaking);
                        let _ = ctx.events.send(SessionEvent::Response {
                            text: round_text.clone(),
                            is_final: false,
                        });
                        if let Some(ref parts) = tts {
                            if parts.text_tx.send(token).await.is_err() {
                                tracing::warn!("tts input closed while streaming tokens");
                            }
                        }
                    }
                    Some(Ok(LlmEvent::ToolCalls(calls))) => {
                        tool_calls = Some(calls);
                        // A tool-call payload terminates the round; text
                        // received alongside it was commentary.
                        break;
                    }
                    Some(Err(e)) => {
                        drop(stream);
                        return fail_turn(&ctx, tts, format!("llm error: {e}")).await;
                    }
                    None => break,
                },
            }
        }
        drop(stream);

        match tool_calls {
            Some(calls) => {
                tracing::info!(
                    round,
                    count = calls.len(),
                    tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "executing tool round"
                );
                ctx.state.set(TurnState::Thinking);

                let assistant = ChatMessage::assistant_tool_calls(calls.clone());
                messages.push(assistant.clone());
                turn_products.push(assistant);

                // Barge-in during tool execution cancels the turn; results
                // of in-flight calls are discarded with everything else.
                let results = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return wind_down_cancelled(tts, ctx.config.cancel_grace).await;
                    }
                    results = ctx.services.tools.execute_calls(&calls) => results,
                };
                messages.extend(results.iter().cloned());
                turn_products.extend(results);

                // Commentary text never survives a tool round, but keep it
                // as a last resort for the round-cap commit.
                final_text = round_text;
            }
            None => {
                final_text = round_text;
                ended_with_text = true;
                break 'rounds;
            }
        }
    }

    if !ended_with_text && !final_text.trim().is_empty() {
        tracing::warn!(cap = ctx.config.max_rounds, "tool-round cap hit, answering with last text");
    }

    // Decide what to commit and make sure it gets spoken.
    let mut commit_text = final_text.trim().to_string();
    if commit_text.is_empty() && turn_products.is_empty() {
        // The model had nothing to say and called no tools.
        return finish_playback(&ctx, tts, None).await;
    }
    // Streamed text already reached the synthesizer token by token; only
    // the fallback still needs to be spoken.
    let mut needs_send = false;
    if commit_text.is_empty() {
        commit_text = ctx.config.fallback_reply.clone();
        needs_send = true;
    }

    if needs_send {
        if tts.is_none() {
            tts = Some(start_tts(&ctx, tts_err_tx.clone()));
        }
        ctx.state.set(TurnState::Speaking);
        if let Some(ref parts) = tts {
            let _ = parts.text_tx.send(commit_text.clone()).await;
        }
    }

    finish_playback(&ctx, tts, Some((commit_text, turn_products))).await
}

/// Snapshot the window and synthesize the system prompt, retrieving
/// context when the agent has RAG enabled. The conversation lock is only
/// held for the snapshots, never across retrieval.
async fn build_window(ctx: &TurnContext) -> Vec<ChatMessage> {
    let history = ctx.conversation.snapshot().await;
    let query = build_rag_query(&history);

    let mut system_prompt = ctx.base_prompt.clone();
    if let Some(retriever) = &ctx.services.retriever {
        if !query.is_empty() {
            match retriever.retrieve(&query).await {
                Ok(contexts) => {
                    tracing::debug!(count = contexts.len(), "retrieved product context");
                    system_prompt = compose_system_prompt(&ctx.base_prompt, &contexts);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval failed, continuing without context");
                }
            }
        }
    }

    let recent = ctx
        .conversation
        .snapshot_recent(ctx.config.history_window)
        .await;
    let mut messages = Vec::with_capacity(recent.len() + 1);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(recent);
    messages
}

fn start_tts(ctx: &TurnContext, err_tx: watch::Sender<Option<String>>) -> TtsParts {
    let driver = TtsDriver::new(ctx.services.tts.clone(), ctx.config.tts.clone());
    let (text_tx, text_rx) = mpsc::channel(64);

    // Child token: an internal failure can stop synthesis without
    // cancelling the turn's own token.
    let tts_cancel = ctx.cancel.child_token();
    let stream = driver.start(text_rx, tts_cancel.clone());
    let _ = ctx.events.send(SessionEvent::PlaybackStarted {
        sample_rate: stream.sample_rate,
    });

    let bridge = ctx.bridge.clone();
    let grace = ctx.config.cancel_grace;
    let playback_cancel = tts_cancel.clone();
    let playback = tokio::spawn(async move {
        let result = bridge.play_stream(stream, playback_cancel, grace).await;
        if let Err(ref e) = result {
            if !matches!(e, PipelineError::Cancelled) {
                let _ = err_tx.send(Some(e.to_string()));
            }
        }
        result
    });

    TtsParts {
        text_tx,
        playback,
        cancel: tts_cancel,
    }
}

/// Close the synthesis stream, wait for end-of-speech, and commit.
async fn finish_playback(
    ctx: &TurnContext,
    tts: Option<TtsParts>,
    commit: Option<(String, Vec<ChatMessage>)>,
) -> TurnOutcome {
    if let Some(parts) = tts {
        drop(parts.text_tx);
        match parts.playback.await {
            Ok(Ok(())) => {}
            Ok(Err(PipelineError::Cancelled)) => return TurnOutcome::Cancelled,
            Ok(Err(e)) => {
                let message = format!("tts failed: {e}");
                let _ = ctx.events.send(SessionEvent::TurnError(message.clone()));
                return TurnOutcome::Failed(message);
            }
            Err(e) => {
                let message = format!("playback task panicked: {e}");
                let _ = ctx.events.send(SessionEvent::TurnError(message.clone()));
                return TurnOutcome::Failed(message);
            }
        }
    }

    match commit {
        Some((text, mut products)) => {
            products.push(ChatMessage::assistant(text.clone()));
            ctx.conversation.extend(products).await;
            let _ = ctx.events.send(SessionEvent::Response {
                text: text.clone(),
                is_final: true,
            });
            TurnOutcome::Completed { text }
        }
        None => TurnOutcome::Completed {
            text: String::new(),
        },
    }
}

/// Cancellation path: the LLM stream is already dropped (connection
/// closed); give the synthesizer and playback the grace budget to stop,
/// then report. Nothing is committed.
async fn wind_down_cancelled(tts: Option<TtsParts>, grace: Duration) -> TurnOutcome {
    if let Some(parts) = tts {
        drop(parts.text_tx);
        let budget = grace * 2;
        match timeout(budget, parts.playback).await {
            Ok(_) => {}
            Err(_) => tracing::warn!(?budget, "playback did not wind down within grace"),
        }
    }
    TurnOutcome::Cancelled
}

/// Failure path: stop synthesis, publish the error, commit nothing.
async fn fail_turn(ctx: &TurnContext, tts: Option<TtsParts>, message: String) -> TurnOutcome {
    tracing::error!(error = %message, "turn failed");
    if let Some(parts) = tts {
        parts.cancel.cancel();
        drop(parts.text_tx);
        let _ = timeout(ctx.config.cancel_grace * 2, parts.playback).await;
    }
    let _ = ctx.events.send(SessionEvent::TurnError(message.clone()));
    TurnOutcome::Failed(message)
}
