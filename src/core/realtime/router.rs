//! Routes realtime frames into state transitions, transcripts and cart mutations.
//!
//! The router is driven by the session actor, one inbound item at a time, so
//! the multi-step sequences here (barge-in, answering function calls) are
//! never interleaved with another event for the same session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::flow::{AudioFlowGate, FlowControlConfig};
use super::messages::{ClientEvent, ServerEvent, SessionConfig, TurnDetection};
use crate::core::order::{MutationOutcome, OrderGateHandle, PendingFunctionCall, order_tools};
use crate::core::session::SessionEvent;
use crate::core::session::state::{SessionState, SessionStateMachine, StateEvent};
use crate::core::transport::TransportConnection;
use crate::errors::{
    ConnectionError, MutationError, ProtocolError, SessionError, SessionResult, StateResult,
};

// =============================================================================
// Configuration
// =============================================================================

/// How turns are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// The model detects speech boundaries; the microphone is open whenever the session is ready
    #[default]
    ServerVad,
    /// The caller starts and stops each utterance
    PushToTalk,
}

/// Router settings.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub turn_mode: TurnMode,
    /// Sent as `session.update` once the remote session exists
    pub session: SessionConfig,
    pub flow: FlowControlConfig,
}

// =============================================================================
// Transcript Buffer
// =============================================================================

/// Who is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Partial transcript of the utterance in progress.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TranscriptBuffer {
    role: Option<TranscriptRole>,
    text: String,
}

impl TranscriptBuffer {
    /// Append a delta. A delta from the other speaker starts a new utterance.
    pub fn push(&mut self, role: TranscriptRole, delta: &str) -> &str {
        if self.role != Some(role) {
            self.text.clear();
            self.role = Some(role);
        }
        self.text.push_str(delta);
        &self.text
    }

    pub fn role(&self) -> Option<TranscriptRole> {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Take the accumulated text if it belongs to `role`.
    pub fn take(&mut self, role: TranscriptRole) -> Option<String> {
        if self.role != Some(role) {
            return None;
        }
        self.role = None;
        Some(std::mem::take(&mut self.text))
    }

    pub fn clear(&mut self) {
        self.role = None;
        self.text.clear();
    }
}

// =============================================================================
// Router
// =============================================================================

/// What the router acts on. Borrowed from the session actor for one item.
pub struct RouterContext<'a> {
    pub machine: &'a mut SessionStateMachine,
    pub transport: &'a TransportConnection,
    pub gate: &'a OrderGateHandle,
    pub events: &'a mpsc::UnboundedSender<SessionEvent>,
}

impl RouterContext<'_> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Default)]
struct CallBuffer {
    name: Option<String>,
    arguments: String,
}

/// Dispatches inbound frames and session commands.
pub struct RealtimeEventRouter {
    config: RouterConfig,
    transcript: TranscriptBuffer,
    flow: AudioFlowGate,
    pending_response_id: Option<String>,
    remote_session_id: Option<String>,
    calls: HashMap<String, CallBuffer>,
    completed_calls: HashSet<String>,
    awaiting_output: HashSet<String>,
    answered_calls: usize,
    follow_up_due: bool,
}

impl RealtimeEventRouter {
    pub fn new(config: RouterConfig) -> Self {
        let flow = AudioFlowGate::new(config.flow);
        Self {
            config,
            transcript: TranscriptBuffer::default(),
            flow,
            pending_response_id: None,
            remote_session_id: None,
            calls: HashMap::new(),
            completed_calls: HashSet::new(),
            awaiting_output: HashSet::new(),
            answered_calls: 0,
            follow_up_due: false,
        }
    }

    pub fn turn_mode(&self) -> TurnMode {
        self.config.turn_mode
    }

    /// Response the model is currently producing.
    pub fn pending_response_id(&self) -> Option<&str> {
        self.pending_response_id.as_deref()
    }

    pub fn remote_session_id(&self) -> Option<&str> {
        self.remote_session_id.as_deref()
    }

    pub fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    pub fn flow(&self) -> &AudioFlowGate {
        &self.flow
    }

    /// Function calls handed to the gate and not yet answered.
    pub fn outstanding_calls(&self) -> usize {
        self.awaiting_output.len()
    }

    /// The `session.update` sent once the remote session exists.
    pub fn session_update(&self) -> ClientEvent {
        let mut session = self.config.session.clone();
        session.turn_detection = match self.config.turn_mode {
            TurnMode::ServerVad => session.turn_detection.or_else(|| Some(TurnDetection::default())),
            TurnMode::PushToTalk => None,
        };
        if session.tools.is_none() {
            session.tools = Some(order_tools());
            session.tool_choice.get_or_insert_with(|| "auto".to_string());
        }
        ClientEvent::SessionUpdate { session }
    }

    /// A new peer replaced the previous one.
    ///
    /// Anything tied to the old remote session is dropped. The transcript
    /// buffer survives; the cart is not the router's to touch.
    pub fn on_transport_reset(&mut self) {
        if !self.awaiting_output.is_empty() {
            debug!(
                orphaned = self.awaiting_output.len(),
                "Dropping function outputs for the previous connection"
            );
        }
        self.calls.clear();
        self.completed_calls.clear();
        self.awaiting_output.clear();
        self.answered_calls = 0;
        self.follow_up_due = false;
        self.pending_response_id = None;
        self.remote_session_id = None;
        self.flow.reset();
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    /// Apply a transition and the audio rules of the resulting state.
    pub fn apply(&mut self, ctx: &mut RouterContext<'_>, event: StateEvent) -> StateResult<SessionState> {
        let state = ctx.machine.transition(event)?;
        self.sync_audio(ctx);
        Ok(state)
    }

    /// Apply a transition the remote asked for; events with no edge are ignored.
    fn apply_remote(&mut self, ctx: &mut RouterContext<'_>, event: StateEvent) -> bool {
        if !ctx.machine.can_apply(event) {
            debug!(state = %ctx.machine.state(), event = ?event, "Ignoring remote event in this state");
            return false;
        }
        self.apply(ctx, event).is_ok()
    }

    /// Open or close the microphone and mute playback for the current state.
    pub fn sync_audio(&mut self, ctx: &RouterContext<'_>) {
        let state = ctx.machine.state();
        let input = match self.config.turn_mode {
            TurnMode::ServerVad => state.is_ready(),
            TurnMode::PushToTalk => state == SessionState::Recording,
        };
        if input {
            ctx.transport.enable_input();
        } else {
            ctx.transport.disable_input();
            self.flow.reset();
        }
        if matches!(state, SessionState::Recording | SessionState::BargeIn) {
            ctx.transport.mute_output();
        }
    }

    async fn send(&self, ctx: &RouterContext<'_>, event: &ClientEvent) -> bool {
        match ctx.transport.send_event(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "Failed to send client event");
                false
            }
        }
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    /// Decode and dispatch one data channel frame.
    ///
    /// Malformed and unknown frames are logged and dropped. An error is
    /// returned only for conditions that must end the session.
    pub async fn handle_frame(&mut self, ctx: &mut RouterContext<'_>, frame: &str) -> SessionResult<()> {
        match ServerEvent::decode(frame) {
            Ok(event) => self.handle_server_event(ctx, event).await,
            Err(ProtocolError::UnknownType(event_type)) => {
                debug!(event_type = %event_type, "Ignoring unknown server event");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                Ok(())
            }
        }
    }

    pub async fn handle_server_event(
        &mut self,
        ctx: &mut RouterContext<'_>,
        event: ServerEvent,
    ) -> SessionResult<()> {
        match event {
            ServerEvent::SessionCreated { session } => {
                info!(remote_session = %session.id, "Remote session created");
                self.remote_session_id = Some(session.id);
                if self.apply_remote(ctx, StateEvent::SessionReady) {
                    let update = self.session_update();
                    self.send(ctx, &update).await;
                }
            }

            ServerEvent::SessionUpdated { .. } => {
                debug!("Session configuration acknowledged");
            }

            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                debug!(audio_start_ms, "Speech started");
                if ctx.machine.state() == SessionState::AwaitingResponse {
                    self.barge_in(ctx, StateEvent::SpeechStarted).await?;
                } else if self.apply_remote(ctx, StateEvent::SpeechStarted) {
                    self.transcript.clear();
                }
            }

            ServerEvent::SpeechStopped { audio_end_ms, .. } => {
                debug!(audio_end_ms, "Speech stopped");
                self.apply_remote(ctx, StateEvent::SpeechStopped);
            }

            ServerEvent::InputAudioBufferCommitted { item_id } => {
                debug!(item_id = ?item_id, "Input audio committed");
            }

            ServerEvent::TranscriptionDelta { delta, .. } => {
                let text = self.transcript.push(TranscriptRole::User, &delta).to_string();
                ctx.emit(SessionEvent::Transcript {
                    role: TranscriptRole::User,
                    text,
                    is_final: false,
                });
            }

            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                self.transcript.take(TranscriptRole::User);
                info!(transcript = %transcript, "User said");
                ctx.emit(SessionEvent::Transcript {
                    role: TranscriptRole::User,
                    text: transcript,
                    is_final: true,
                });
                self.apply_remote(ctx, StateEvent::TranscriptCompleted);
            }

            ServerEvent::ResponseCreated { response } => {
                debug!(response_id = %response.id, "Response started");
                if self.awaiting_output.is_empty() && self.answered_calls == 0 {
                    self.completed_calls.clear();
                }
                self.pending_response_id = Some(response.id);
                ctx.transport.unmute_output();
                self.apply_remote(ctx, StateEvent::ResponseCreated);
            }

            ServerEvent::OutputItemAdded { item, .. } => {
                if item.item_type == "function_call"
                    && let Some(call_id) = item.call_id
                {
                    debug!(call_id = %call_id, name = ?item.name, "Function call started");
                    if !self.completed_calls.contains(&call_id) {
                        self.calls.entry(call_id).or_default().name = item.name;
                    }
                }
            }

            ServerEvent::OutputItemDelta { item_id, .. } => {
                trace!(item_id = ?item_id, "Output item delta");
            }

            ServerEvent::AudioTranscriptDelta { delta, .. } | ServerEvent::TextDelta { delta, .. } => {
                let text = self.transcript.push(TranscriptRole::Assistant, &delta).to_string();
                ctx.emit(SessionEvent::Transcript {
                    role: TranscriptRole::Assistant,
                    text,
                    is_final: false,
                });
            }

            ServerEvent::AudioTranscriptDone { transcript, .. } => {
                let buffered = self.transcript.take(TranscriptRole::Assistant);
                if let Some(text) = transcript.or(buffered) {
                    ctx.emit(SessionEvent::Transcript {
                        role: TranscriptRole::Assistant,
                        text,
                        is_final: true,
                    });
                }
            }

            ServerEvent::FunctionCallArgumentsDelta { call_id, delta, .. } => {
                if self.completed_calls.contains(&call_id) {
                    debug!(call_id = %call_id, "Ignoring arguments for a completed call");
                } else {
                    self.calls.entry(call_id).or_default().arguments.push_str(&delta);
                }
            }

            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
                ..
            } => {
                self.complete_call(ctx, call_id, name, arguments);
            }

            ServerEvent::ResponseDone { response } => {
                debug!(response_id = %response.id, status = %response.status, "Response finished");
                if self.pending_response_id.as_deref() == Some(response.id.as_str())
                    || response.id.is_empty()
                {
                    self.pending_response_id = None;
                }
                let had_calls = response
                    .output
                    .iter()
                    .any(|item| item.item_type == "function_call");
                if had_calls || !self.awaiting_output.is_empty() || self.answered_calls > 0 {
                    self.follow_up_due = true;
                }
                self.apply_remote(ctx, StateEvent::ResponseDone);
                self.maybe_follow_up(ctx).await;
            }

            ServerEvent::Error { error } => {
                warn!(
                    error_type = %error.error_type,
                    code = ?error.code,
                    message = %error.message,
                    "Remote error"
                );
                ctx.emit(SessionEvent::RemoteError {
                    code: error.code,
                    message: error.message,
                });
            }

            ServerEvent::RateLimitsUpdated { rate_limits } => {
                for limit in &rate_limits {
                    debug!(name = %limit.name, remaining = limit.remaining, limit = limit.limit, "Rate limit");
                }
            }

            ServerEvent::Unknown => {
                debug!("Ignoring unknown server event");
            }
        }
        Ok(())
    }

    fn complete_call(
        &mut self,
        ctx: &RouterContext<'_>,
        call_id: String,
        name: Option<String>,
        arguments: Option<String>,
    ) {
        if !self.completed_calls.insert(call_id.clone()) {
            debug!(call_id = %call_id, "Ignoring duplicate function call completion");
            return;
        }

        let buffered = self.calls.remove(&call_id).unwrap_or_default();
        let name = name.or(buffered.name).unwrap_or_default();
        let arguments = arguments.unwrap_or(buffered.arguments);
        info!(call_id = %call_id, name = %name, "Function call complete");

        match ctx.gate.submit(PendingFunctionCall::new(call_id.clone(), name, arguments)) {
            Ok(()) => {
                self.awaiting_output.insert(call_id);
            }
            Err(e) => error!(call_id = %call_id, error = %e, "Could not queue function call"),
        }
    }

    // =========================================================================
    // Mutation outcomes
    // =========================================================================

    /// Report a mutation outcome to the caller and answer the model.
    pub async fn handle_outcome(
        &mut self,
        ctx: &mut RouterContext<'_>,
        outcome: MutationOutcome,
    ) -> SessionResult<()> {
        let call_id = outcome.call.call_id.clone();

        match &outcome.result {
            Ok(cart) => ctx.emit(SessionEvent::CartUpdated(cart.clone())),
            Err(e) if e.is_fatal() => {
                error!(call_id = %call_id, error = %e, "Fatal order mutation failure");
                let _ = ctx.machine.transition(StateEvent::Fatal);
                return Err(SessionError::Mutation(e.clone()));
            }
            Err(e) if e.needs_clarification() => {
                let suggestion = match e {
                    MutationError::MenuItemNotFound { suggestion, .. } => suggestion.clone(),
                    _ => None,
                };
                ctx.emit(SessionEvent::ClarificationNeeded {
                    call_id: call_id.clone(),
                    message: e.to_string(),
                    suggestion,
                });
            }
            Err(_) => {}
        }

        if !self.awaiting_output.remove(&call_id) {
            debug!(call_id = %call_id, "Outcome belongs to a previous connection, not answering");
            return Ok(());
        }

        let output = ClientEvent::function_output(&call_id, outcome.output_json());
        self.send(ctx, &output).await;
        self.answered_calls += 1;
        self.maybe_follow_up(ctx).await;
        Ok(())
    }

    async fn maybe_follow_up(&mut self, ctx: &RouterContext<'_>) {
        if !self.follow_up_due || !self.awaiting_output.is_empty() || self.answered_calls == 0 {
            return;
        }
        self.follow_up_due = false;
        self.answered_calls = 0;

        if ctx.machine.state() != SessionState::Idle {
            debug!(state = %ctx.machine.state(), "Skipping follow-up response");
            return;
        }
        debug!("All function calls answered, requesting follow-up response");
        self.send(ctx, &ClientEvent::response_create()).await;
    }

    // =========================================================================
    // Barge-in
    // =========================================================================

    /// Interrupt the model: cancel its response, silence playback, start recording.
    async fn barge_in(&mut self, ctx: &mut RouterContext<'_>, trigger: StateEvent) -> SessionResult<()> {
        info!(response_id = ?self.pending_response_id, "Barge-in");

        self.send(ctx, &ClientEvent::ResponseCancel).await;
        ctx.transport.mute_output();

        self.apply(ctx, trigger)?;
        self.transcript.clear();
        self.pending_response_id = None;
        self.calls.clear();
        self.apply(ctx, StateEvent::BargeInHandled)?;
        Ok(())
    }

    // =========================================================================
    // Audio
    // =========================================================================

    /// Captured microphone audio.
    pub async fn handle_audio_chunk(&mut self, ctx: &RouterContext<'_>, chunk: Bytes) {
        if !ctx.transport.tracks().input_enabled() {
            trace!("Dropping audio captured while input is disabled");
            return;
        }
        if let Some(chunk) = self.flow.offer(chunk) {
            self.send_chunk(ctx, chunk).await;
        }
    }

    /// The transport finished sending one chunk.
    pub async fn handle_audio_ack(&mut self, ctx: &RouterContext<'_>) {
        if let Some(chunk) = self.flow.ack() {
            self.send_chunk(ctx, chunk).await;
        }
    }

    /// Send `chunk`; on failure move on to the next queued chunk until one goes
    /// out or the backlog is empty.
    async fn send_chunk(&mut self, ctx: &RouterContext<'_>, chunk: Bytes) {
        let mut next = Some(chunk);
        while let Some(chunk) = next.take() {
            if let Err(e) = ctx.transport.send_audio(chunk).await {
                match e {
                    ConnectionError::NotConnected => {
                        trace!("Dropping audio, transport not connected")
                    }
                    e => warn!(error = %e, "Failed to send audio chunk"),
                }
                next = self.flow.release();
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Caller wants to speak. Interrupts the model if it is responding.
    pub async fn start_recording(&mut self, ctx: &mut RouterContext<'_>) -> SessionResult<()> {
        match ctx.machine.state() {
            SessionState::AwaitingResponse => self.barge_in(ctx, StateEvent::StartRecording).await?,
            SessionState::Recording => {}
            _ => {
                self.apply(ctx, StateEvent::StartRecording)?;
                self.transcript.clear();
            }
        }
        if self.config.turn_mode == TurnMode::PushToTalk {
            self.send(ctx, &ClientEvent::InputAudioBufferClear).await;
        }
        Ok(())
    }

    /// Caller finished speaking.
    pub async fn stop_recording(&mut self, ctx: &mut RouterContext<'_>) -> SessionResult<()> {
        self.apply(ctx, StateEvent::StopRecording)?;
        if self.config.turn_mode == TurnMode::PushToTalk {
            self.send(ctx, &ClientEvent::InputAudioBufferCommit).await;
            self.send(ctx, &ClientEvent::response_create()).await;
        }
        Ok(())
    }

    /// Typed input in place of speech.
    pub async fn send_text(&mut self, ctx: &mut RouterContext<'_>, text: &str) -> SessionResult<()> {
        if !ctx.machine.state().is_ready() {
            return Err(ConnectionError::NotConnected.into());
        }
        ctx.transport.send_event(&ClientEvent::user_text(text)).await?;
        ctx.transport.send_event(&ClientEvent::response_create()).await?;
        ctx.emit(SessionEvent::Transcript {
            role: TranscriptRole::User,
            text: text.to_string(),
            is_final: true,
        });
        Ok(())
    }
}
