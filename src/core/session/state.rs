//! Session state machine.
//!
//! A pure, table-driven machine: it never touches the network or the cart.
//! The session actor feeds it events and arms a timer from [`SessionStateMachine::deadline`];
//! when the timer fires the actor calls [`SessionStateMachine::fire_timeout`], so no state can be
//! occupied forever.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{StateError, StateResult};

/// Capacity of the state change broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// States and Events
// =============================================================================

/// States a session can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingSessionReady,
    Idle,
    Recording,
    AwaitingTranscript,
    AwaitingResponse,
    BargeIn,
    Paused,
    Timeout,
    Error,
}

impl SessionState {
    /// All declared states, in table order.
    pub const ALL: [SessionState; 11] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::AwaitingSessionReady,
        SessionState::Idle,
        SessionState::Recording,
        SessionState::AwaitingTranscript,
        SessionState::AwaitingResponse,
        SessionState::BargeIn,
        SessionState::Paused,
        SessionState::Timeout,
        SessionState::Error,
    ];

    /// Whether a live transport is expected in this state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingSessionReady
                | SessionState::Idle
                | SessionState::Recording
                | SessionState::AwaitingTranscript
                | SessionState::AwaitingResponse
                | SessionState::BargeIn
                | SessionState::Paused
        )
    }

    /// Whether the session is capturing audio or waiting on the remote model.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Recording
                | SessionState::AwaitingTranscript
                | SessionState::AwaitingResponse
                | SessionState::BargeIn
        )
    }

    /// Session is ready for a turn (model reachable and not paused).
    pub fn is_ready(&self) -> bool {
        self.is_connected() && !matches!(self, SessionState::AwaitingSessionReady | SessionState::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::AwaitingSessionReady => "AWAITING_SESSION_READY",
            SessionState::Idle => "IDLE",
            SessionState::Recording => "RECORDING",
            SessionState::AwaitingTranscript => "AWAITING_TRANSCRIPT",
            SessionState::AwaitingResponse => "AWAITING_RESPONSE",
            SessionState::BargeIn => "BARGE_IN",
            SessionState::Paused => "PAUSED",
            SessionState::Timeout => "TIMEOUT",
            SessionState::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    ConnectRequested,
    TransportConnected,
    ConnectFailed,
    SessionReady,
    SpeechStarted,
    SpeechStopped,
    StartRecording,
    StopRecording,
    TranscriptCompleted,
    ResponseCreated,
    ResponseDone,
    BargeInHandled,
    Pause,
    Resume,
    TransportLost,
    Reconnect,
    /// Synthetic event raised when a state's deadline passes
    Timeout,
    Stop,
    Fatal,
}

/// Looks up the transition table.
///
/// Returns `None` when no edge is defined for `event` in `from`.
pub fn next_state(from: SessionState, event: StateEvent) -> Option<SessionState> {
    use SessionState as S;
    use StateEvent as E;

    let specific = match (from, event) {
        (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),

        (S::Connecting, E::TransportConnected) => Some(S::AwaitingSessionReady),
        (S::Connecting, E::ConnectFailed | E::TransportLost | E::Timeout) => Some(S::Timeout),

        (S::AwaitingSessionReady, E::SessionReady) => Some(S::Idle),
        (S::AwaitingSessionReady, E::Timeout) => Some(S::Timeout),

        (S::Idle, E::SpeechStarted | E::StartRecording) => Some(S::Recording),
        (S::Idle, E::ResponseCreated) => Some(S::AwaitingResponse),
        (S::Idle, E::SessionReady | E::TranscriptCompleted | E::ResponseDone) => Some(S::Idle),
        (S::Idle, E::Pause | E::Timeout) => Some(S::Paused),

        (S::Recording, E::SpeechStopped | E::StopRecording) => Some(S::AwaitingTranscript),
        (S::Recording, E::SpeechStarted | E::StartRecording) => Some(S::Recording),
        (S::Recording, E::ResponseCreated) => Some(S::AwaitingResponse),
        (S::Recording, E::Pause) => Some(S::Paused),
        (S::Recording, E::Timeout) => Some(S::Idle),

        (S::AwaitingTranscript, E::TranscriptCompleted | E::ResponseCreated) => {
            Some(S::AwaitingResponse)
        }
        (S::AwaitingTranscript, E::SpeechStarted | E::StartRecording) => Some(S::Recording),
        (S::AwaitingTranscript, E::ResponseDone | E::Timeout) => Some(S::Idle),

        (S::AwaitingResponse, E::SpeechStarted | E::StartRecording) => Some(S::BargeIn),
        (S::AwaitingResponse, E::ResponseCreated | E::TranscriptCompleted) => {
            Some(S::AwaitingResponse)
        }
        (S::AwaitingResponse, E::ResponseDone | E::Timeout) => Some(S::Idle),

        (S::BargeIn, E::BargeInHandled) => Some(S::Recording),
        (S::BargeIn, E::Timeout) => Some(S::Idle),

        (S::Paused, E::Resume) => Some(S::Idle),
        (S::Paused, E::Timeout) => Some(S::Disconnected),

        (S::Timeout, E::Reconnect) => Some(S::Connecting),
        (S::Timeout, E::Timeout) => Some(S::Error),

        (S::Error, E::Timeout) => Some(S::Disconnected),

        _ => None,
    };

    if specific.is_some() {
        return specific;
    }

    // Edges shared by every state except DISCONNECTED.
    match (from, event) {
        (S::Disconnected, _) => None,
        (_, E::Stop) => Some(S::Disconnected),
        (_, E::Fatal) => Some(S::Error),
        (state, E::TransportLost | E::ConnectFailed) if state.is_connected() => Some(S::Timeout),
        _ => None,
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Per-state timeouts in milliseconds. Zero disables the timer for that state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTimeouts {
    pub connecting_ms: u64,
    pub awaiting_session_ready_ms: u64,
    pub idle_ms: u64,
    pub recording_ms: u64,
    pub awaiting_transcript_ms: u64,
    pub awaiting_response_ms: u64,
    pub barge_in_ms: u64,
    pub paused_ms: u64,
    pub timeout_ms: u64,
    pub error_ms: u64,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            connecting_ms: 15_000,
            awaiting_session_ready_ms: 10_000,
            idle_ms: 60_000,
            recording_ms: 30_000,
            awaiting_transcript_ms: 8_000,
            awaiting_response_ms: 15_000,
            barge_in_ms: 2_000,
            paused_ms: 300_000,
            timeout_ms: 30_000,
            error_ms: 5_000,
        }
    }
}

impl StateTimeouts {
    /// Timeout for `state`, or `None` when the state has no timer.
    pub fn for_state(&self, state: SessionState) -> Option<Duration> {
        let ms = match state {
            SessionState::Disconnected => 0,
            SessionState::Connecting => self.connecting_ms,
            SessionState::AwaitingSessionReady => self.awaiting_session_ready_ms,
            SessionState::Idle => self.idle_ms,
            SessionState::Recording => self.recording_ms,
            SessionState::AwaitingTranscript => self.awaiting_transcript_ms,
            SessionState::AwaitingResponse => self.awaiting_response_ms,
            SessionState::BargeIn => self.barge_in_ms,
            SessionState::Paused => self.paused_ms,
            SessionState::Timeout => self.timeout_ms,
            SessionState::Error => self.error_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A state change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
    /// Event that caused the change; `None` for forced changes
    pub event: Option<StateEvent>,
    pub forced: bool,
}

/// Table-driven session state machine with per-state deadlines.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    entered_at: Instant,
    timeouts: StateTimeouts,
    changes: broadcast::Sender<StateChange>,
}

impl SessionStateMachine {
    pub fn new(timeouts: StateTimeouts) -> Self {
        let (changes, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            state: SessionState::Disconnected,
            entered_at: Instant::now(),
            timeouts,
            changes,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn timeouts(&self) -> &StateTimeouts {
        &self.timeouts
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Sender side of the change stream, for subscribers created elsewhere.
    pub fn changes(&self) -> broadcast::Sender<StateChange> {
        self.changes.clone()
    }

    /// Whether `event` has an edge from the current state.
    pub fn can_apply(&self, event: StateEvent) -> bool {
        next_state(self.state, event).is_some()
    }

    /// Apply `event`.
    ///
    /// Self-loops refresh the state's deadline without broadcasting. An undefined
    /// edge is rejected; if the current state also has no armed timer to recover
    /// through, the machine is forced to `ERROR`.
    pub fn transition(&mut self, event: StateEvent) -> StateResult<SessionState> {
        let from = self.state;
        let Some(to) = next_state(from, event) else {
            warn!(state = %from, event = ?event, "Invalid state transition");
            if !self.has_recovery_edge() {
                self.force_state(SessionState::Error, "undefined transition with no recovery edge");
            }
            return Err(StateError::InvalidTransition { from, event });
        };

        self.entered_at = Instant::now();
        if to != from {
            self.state = to;
            debug!(from = %from, to = %to, event = ?event, "Session state changed");
            let _ = self.changes.send(StateChange {
                from,
                to,
                event: Some(event),
                forced: false,
            });
        }
        Ok(to)
    }

    /// Move to `state` bypassing the table. Reserved for recovery paths.
    pub fn force_state(&mut self, state: SessionState, reason: &str) {
        let from = self.state;
        warn!(from = %from, to = %state, reason = %reason, "Forcing session state");
        self.state = state;
        self.entered_at = Instant::now();
        let _ = self.changes.send(StateChange {
            from,
            to: state,
            event: None,
            forced: true,
        });
    }

    /// When the current state's timer expires, if it has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeouts
            .for_state(self.state)
            .map(|timeout| self.entered_at + timeout)
    }

    /// Apply the synthetic timeout event for the current state.
    pub fn fire_timeout(&mut self) -> StateResult<SessionState> {
        debug!(state = %self.state, "State deadline elapsed");
        self.transition(StateEvent::Timeout)
    }

    fn has_recovery_edge(&self) -> bool {
        self.state == SessionState::Disconnected
            || (self.timeouts.for_state(self.state).is_some()
                && next_state(self.state, StateEvent::Timeout).is_some())
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new(StateTimeouts::default())
    }
}
