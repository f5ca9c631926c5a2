//! Voice ordering session.
//!
//! One actor task per session owns the state machine, the transport and the
//! event router. Transport events, mutation outcomes and caller commands all
//! arrive on a single queue and are handled one at a time, alongside the
//! current state's deadline. Callers talk to the actor through a cloneable
//! [`SessionHandle`] and receive [`SessionEvent`]s on an unbounded channel.

pub mod state;

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::order::{
    Cart, MenuCatalog, MutationOutcome, OrderGateConfig, OrderGateHandle, OrderGateWorker,
    OrderMutationGate, OutcomeCallback,
};
use crate::core::realtime::{
    ClientEvent, RealtimeEventRouter, RouterConfig, RouterContext, TranscriptRole,
};
use crate::core::reconnect::{ReconnectionConfig, ReconnectionEvent, ReconnectionSupervisor};
use crate::core::transport::signaling::DEFAULT_CREDENTIAL_TIMEOUT;
use crate::core::transport::{
    DEFAULT_CONNECT_TIMEOUT, DeviceEvent, EventSink, MicrophoneSource, PeerEvent, PeerFactory,
    TokenBroker, TransportConnection, TransportEvent,
};
use crate::errors::{ConnectionError, MutationResult, SessionError, SessionResult};

pub use state::{
    SessionState, SessionStateMachine, StateChange, StateEvent, StateTimeouts, next_state,
};

// =============================================================================
// Public Types
// =============================================================================

/// What a session reports to its caller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(StateChange),
    Transcript {
        role: TranscriptRole,
        text: String,
        is_final: bool,
    },
    /// Cart after a successful mutation
    CartUpdated(Cart),
    /// A spoken reference could not be resolved; ask the guest
    ClarificationNeeded {
        call_id: String,
        message: String,
        suggestion: Option<String>,
    },
    /// The model reported an error; the session carries on
    RemoteError {
        code: Option<String>,
        message: String,
    },
    /// Microphone permission denied or the track ended
    MicrophoneLost(ConnectionError),
    /// The device silenced the microphone; nothing is captured until unmuted
    MicrophoneMuted,
    MicrophoneUnmuted,
    Reconnected(ReconnectionEvent),
    /// The session cannot continue
    Failed(SessionError),
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub timeouts: StateTimeouts,
    pub connect_timeout: Duration,
    pub credential_timeout: Duration,
    pub reconnection: ReconnectionConfig,
    pub router: RouterConfig,
    pub gate: OrderGateConfig,
    /// Acquire the microphone on start
    pub capture_audio: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeouts: StateTimeouts::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
            reconnection: ReconnectionConfig::default(),
            router: RouterConfig::default(),
            gate: OrderGateConfig::default(),
            capture_audio: true,
        }
    }
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionServices {
    pub broker: Arc<dyn TokenBroker>,
    pub peers: Arc<dyn PeerFactory>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub catalog: Arc<dyn MenuCatalog>,
}

/// Identity and timing of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub started_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
}

impl Session {
    fn new() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            started_at: now,
            last_activity_at: now,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = OffsetDateTime::now_utc();
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: Session,
    pub state: SessionState,
    pub pending_response_id: Option<String>,
    pub remote_session_id: Option<String>,
    pub generation: u64,
}

// =============================================================================
// Handle
// =============================================================================

type Reply<T> = oneshot::Sender<SessionResult<T>>;

enum Command {
    StartRecording(Reply<()>),
    StopRecording(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    SendText(String, Reply<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

enum SessionInput {
    Transport(TransportEvent),
    Outcome(MutationOutcome),
    Command(Command),
}

/// Caller side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    inbox: mpsc::UnboundedSender<SessionInput>,
    changes: broadcast::Sender<StateChange>,
    gate: OrderMutationGate,
    cancel: CancellationToken,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    /// Start a session: spawn its actor and begin connecting.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        options: SessionOptions,
        services: SessionServices,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let session = Session::new();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let transport_tx = inbox_tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = transport_tx.send(SessionInput::Transport(event));
        });
        let transport = TransportConnection::new(services.peers, services.microphone, sink);

        let gate = OrderMutationGate::new(services.catalog, options.gate.clone());
        let outcome_tx = inbox_tx.clone();
        let on_outcome: OutcomeCallback = Arc::new(move |outcome| {
            let tx = outcome_tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionInput::Outcome(outcome));
            })
        });
        let (gate_handle, worker) = OrderGateWorker::spawn(gate.clone(), on_outcome, cancel.child_token());

        let machine = SessionStateMachine::new(options.timeouts.clone());
        let changes = machine.changes();
        let state_rx = machine.subscribe();

        let supervisor = ReconnectionSupervisor::new(options.reconnection.clone(), services.broker.clone())
            .with_connect_timeout(options.connect_timeout)
            .with_credential_timeout(options.credential_timeout);

        info!(session_id = %session.id, "Starting session");
        let actor = SessionActor {
            session,
            machine,
            state_rx,
            transport,
            router: RealtimeEventRouter::new(options.router.clone()),
            gate: gate_handle,
            worker: Some(worker),
            supervisor,
            broker: services.broker,
            inbox: inbox_rx,
            events: events_tx,
            cancel: cancel.clone(),
            options,
        };
        let id = actor.session.id;
        let task = tokio::spawn(actor.run());

        (
            Self {
                id,
                inbox: inbox_tx,
                changes,
                gate,
                cancel,
                task: Arc::new(parking_lot::Mutex::new(Some(task))),
            },
            events_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// The session's cart gate, for direct cart operations.
    pub fn gate(&self) -> &OrderMutationGate {
        &self.gate
    }

    /// Current cart.
    pub async fn cart(&self) -> MutationResult<Cart> {
        self.gate.snapshot().await
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.inbox.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> SessionResult<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(SessionInput::Command(command(tx)))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Start capturing an utterance, interrupting the model if it is speaking.
    pub async fn start_recording(&self) -> SessionResult<()> {
        self.request(Command::StartRecording).await
    }

    pub async fn stop_recording(&self) -> SessionResult<()> {
        self.request(Command::StopRecording).await
    }

    pub async fn pause(&self) -> SessionResult<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> SessionResult<()> {
        self.request(Command::Resume).await
    }

    /// Send typed input instead of speech.
    pub async fn send_text(&self, text: impl Into<String>) -> SessionResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(SessionInput::Command(Command::Snapshot(tx)))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// End the session and wait for teardown. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(session_id = %self.id, error = %e, "Session task failed");
        }
    }

    /// Wait for the session to end on its own.
    pub async fn closed(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(session_id = %self.id, error = %e, "Session task failed");
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

struct SessionActor {
    session: Session,
    machine: SessionStateMachine,
    state_rx: broadcast::Receiver<StateChange>,
    transport: TransportConnection,
    router: RealtimeEventRouter,
    gate: OrderGateHandle,
    worker: Option<JoinHandle<()>>,
    supervisor: ReconnectionSupervisor,
    broker: Arc<dyn TokenBroker>,
    inbox: mpsc::UnboundedReceiver<SessionInput>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    options: SessionOptions,
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    fn split(&mut self) -> (RouterContext<'_>, &mut RealtimeEventRouter) {
        (
            RouterContext {
                machine: &mut self.machine,
                transport: &self.transport,
                gate: &self.gate,
                events: &self.events,
            },
            &mut self.router,
        )
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Forward state changes to the caller, in order.
    fn flush_state_changes(&mut self) {
        loop {
            match self.state_rx.try_recv() {
                Ok(change) => {
                    let _ = self.events.send(SessionEvent::StateChanged(change));
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "State change notifications lagged");
                }
                Err(_) => break,
            }
        }
    }

    async fn run(mut self) {
        self.connect().await;
        self.flush_state_changes();

        while self.machine.state() != SessionState::Disconnected {
            let deadline = self.machine.deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = self.inbox.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => break,
                },
                _ = sleep_until(deadline) => self.handle_deadline().await,
            }
            self.flush_state_changes();
        }

        self.shutdown().await;
    }

    async fn connect(&mut self) {
        if let Err(e) = self.machine.transition(StateEvent::ConnectRequested) {
            error!(error = %e, "Cannot start connecting");
            return;
        }

        if self.options.capture_audio
            && let Err(e) = self.transport.setup_microphone().await
        {
            warn!(error = %e, "Continuing without microphone");
        }

        let broker = self.broker.clone();
        let transport = &self.transport;
        let credential_timeout = self.options.credential_timeout;
        let connect_timeout = self.options.connect_timeout;
        let connect = async move {
            let credential = tokio::time::timeout(credential_timeout, broker.fetch())
                .await
                .map_err(|_| {
                    ConnectionError::Credential(format!(
                        "no credential within {}ms",
                        credential_timeout.as_millis()
                    ))
                })??;
            transport.connect(&credential, connect_timeout).await
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = connect => result,
        };

        match result {
            Ok(generation) => {
                info!(generation, "Transport ready, waiting for remote session");
                self.router.on_transport_reset();
                let _ = self.machine.transition(StateEvent::TransportConnected);
            }
            Err(e) => {
                warn!(error = %e, "Initial connection failed");
                let _ = self.machine.transition(StateEvent::ConnectFailed);
                self.recover().await;
            }
        }
    }

    async fn recover(&mut self) {
        self.transport.disable_input();
        self.flush_state_changes();
        match self
            .supervisor
            .recover(&mut self.machine, &self.transport, &self.cancel)
            .await
        {
            Ok(event) => {
                self.router.on_transport_reset();
                self.flush_state_changes();
                self.emit(SessionEvent::Reconnected(event));
            }
            Err(SessionError::Stopped) => debug!("Reconnection cancelled"),
            Err(e) => self.fail(e).await,
        }
    }

    async fn fail(&mut self, e: SessionError) {
        error!(session_id = %self.session.id, error = %e, "Session failed");
        if !matches!(self.machine.state(), SessionState::Error | SessionState::Disconnected) {
            self.machine.force_state(SessionState::Error, "session failure");
        }
        self.transport.disconnect().await;
        self.transport.disable_input();
        self.flush_state_changes();
        self.emit(SessionEvent::Failed(e));
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Transport(event) => self.handle_transport(event).await,
            SessionInput::Outcome(outcome) => {
                let result = {
                    let (mut ctx, router) = self.split();
                    router.handle_outcome(&mut ctx, outcome).await
                };
                if let Err(e) = result {
                    self.fail(e).await;
                }
            }
            SessionInput::Command(command) => {
                self.session.touch();
                self.handle_command(command).await;
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Peer { generation, event } => {
                if generation != self.transport.generation() {
                    trace!(generation, live = self.transport.generation(), "Dropping stale peer event");
                    return;
                }
                match event {
                    PeerEvent::Opened => debug!(generation, "Peer opened"),
                    PeerEvent::Frame(frame) => {
                        self.session.touch();
                        let result = {
                            let (mut ctx, router) = self.split();
                            router.handle_frame(&mut ctx, &frame).await
                        };
                        if let Err(e) = result
                            && e.is_fatal()
                        {
                            self.fail(e).await;
                        }
                    }
                    PeerEvent::AudioAck => {
                        let (ctx, router) = self.split();
                        router.handle_audio_ack(&ctx).await;
                    }
                    PeerEvent::Closed { reason } => {
                        self.connection_lost(&format!("connection closed: {reason}")).await
                    }
                    PeerEvent::ConnectTimeout => self.connection_lost("connection timed out").await,
                    PeerEvent::IceFailed(reason) => {
                        self.connection_lost(&format!("ICE failed: {reason}")).await
                    }
                }
            }
            TransportEvent::Device(event) => match event {
                DeviceEvent::Chunk(chunk) => {
                    let (ctx, router) = self.split();
                    router.handle_audio_chunk(&ctx, chunk).await;
                }
                DeviceEvent::MicrophoneDenied(reason) => {
                    self.emit(SessionEvent::MicrophoneLost(ConnectionError::MicrophoneDenied(reason)));
                }
                DeviceEvent::TrackEnded => {
                    warn!("Microphone track ended");
                    self.emit(SessionEvent::MicrophoneLost(ConnectionError::MicrophoneRevoked(
                        "track ended".to_string(),
                    )));
                }
                DeviceEvent::TrackMuted => {
                    warn!("Microphone muted by the device");
                    self.emit(SessionEvent::MicrophoneMuted);
                }
                DeviceEvent::TrackUnmuted => {
                    info!("Microphone unmuted by the device");
                    self.emit(SessionEvent::MicrophoneUnmuted);
                }
            },
        }
    }

    async fn connection_lost(&mut self, reason: &str) {
        if !self.machine.state().is_connected() {
            debug!(state = %self.machine.state(), reason, "Ignoring transport loss outside a connected state");
            return;
        }
        warn!(reason, "Transport lost, reconnecting");
        self.recover().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartRecording(reply) => {
                let (mut ctx, router) = self.split();
                let _ = reply.send(router.start_recording(&mut ctx).await);
            }
            Command::StopRecording(reply) => {
                let (mut ctx, router) = self.split();
                let _ = reply.send(router.stop_recording(&mut ctx).await);
            }
            Command::Pause(reply) => {
                let (mut ctx, router) = self.split();
                let result = router.apply(&mut ctx, StateEvent::Pause).map(|_| ()).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let (mut ctx, router) = self.split();
                let result = router.apply(&mut ctx, StateEvent::Resume).map(|_| ()).map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::SendText(text, reply) => {
                let (mut ctx, router) = self.split();
                let _ = reply.send(router.send_text(&mut ctx, &text).await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    session: self.session.clone(),
                    state: self.machine.state(),
                    pending_response_id: self.router.pending_response_id().map(str::to_string),
                    remote_session_id: self.router.remote_session_id().map(str::to_string),
                    generation: self.transport.generation(),
                });
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let from = self.machine.state();
        let Ok(to) = self.machine.fire_timeout() else {
            return;
        };
        info!(from = %from, to = %to, "State timed out");

        {
            let (ctx, router) = self.split();
            router.sync_audio(&ctx);
        }

        match (from, to) {
            (SessionState::Connecting | SessionState::AwaitingSessionReady, SessionState::Timeout) => {
                self.recover().await;
            }
            (SessionState::AwaitingResponse, _) => {
                if let Err(e) = self.transport.send_event(&ClientEvent::ResponseCancel).await {
                    debug!(error = %e, "Could not cancel stalled response");
                }
            }
            (_, SessionState::Error) => {
                self.transport.disconnect().await;
                self.emit(SessionEvent::Failed(SessionError::Connection(ConnectionError::Timeout {
                    after_ms: self
                        .machine
                        .timeouts()
                        .for_state(from)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default(),
                })));
            }
            _ => {}
        }
    }

    async fn shutdown(&mut self) {
        info!(session_id = %self.session.id, state = %self.machine.state(), "Stopping session");
        self.cancel.cancel();
        self.transport.disable_input();
        self.transport.disconnect().await;
        self.transport.release_microphone();
        if self.machine.state() != SessionState::Disconnected {
            let _ = self.machine.transition(StateEvent::Stop);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.flush_state_changes();
    }
}
