//! Transport connection to the realtime model.
//!
//! [`TransportConnection`] owns at most one peer at a time. Each `connect`
//! closes the previous peer, creates a fresh one through the [`PeerFactory`]
//! and bumps the connection generation; closing bumps it again, so events
//! still in flight from a replaced peer are recognisably stale.
//!
//! The microphone outlives individual peers: it is acquired once, starts
//! disabled, and only forwards audio while input is enabled.

pub mod loopback;
pub mod microphone;
pub mod peer;
pub mod signaling;
#[cfg(feature = "webrtc-peer")]
pub mod webrtc;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::realtime::messages::ClientEvent;
use crate::errors::{ConnectionError, ConnectionResult};

pub use loopback::{LoopbackFactory, LoopbackRemote, MuteObserver};
pub use microphone::{
    ChannelMicrophone, MicrophoneSignal, MicrophoneSource, MicrophoneTrack, ReaderMicrophone,
};
pub use peer::{
    DeviceEvent, EventSink, PeerBackend, PeerEvent, PeerEventSink, PeerFactory, TransportEvent,
};
pub use signaling::{
    EphemeralCredential, HttpTokenBroker, SdpSignaling, StaticTokenBroker, TokenBroker,
};

/// Default connection establishment timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for a single outbound send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Microphone and playback flags.
#[derive(Debug, Default)]
pub struct AudioTrackHandle {
    input_enabled: AtomicBool,
    output_muted: AtomicBool,
    microphone_acquired: AtomicBool,
}

impl AudioTrackHandle {
    pub fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::SeqCst)
    }

    pub fn output_muted(&self) -> bool {
        self.output_muted.load(Ordering::SeqCst)
    }

    pub fn microphone_acquired(&self) -> bool {
        self.microphone_acquired.load(Ordering::SeqCst)
    }
}

/// Connection to the realtime model.
pub struct TransportConnection {
    factory: Arc<dyn PeerFactory>,
    microphone: Arc<dyn MicrophoneSource>,
    sink: EventSink,
    peer: Mutex<Option<Arc<dyn PeerBackend>>>,
    generation: AtomicU64,
    tracks: Arc<AudioTrackHandle>,
    microphone_task: Mutex<Option<JoinHandle<()>>>,
    send_timeout: Duration,
}

impl TransportConnection {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        microphone: Arc<dyn MicrophoneSource>,
        sink: EventSink,
    ) -> Self {
        Self {
            factory,
            microphone,
            sink,
            peer: Mutex::new(None),
            generation: AtomicU64::new(0),
            tracks: Arc::new(AudioTrackHandle::default()),
            microphone_task: Mutex::new(None),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Generation of the live peer, or of the last one closed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.peer.lock().is_some()
    }

    pub fn tracks(&self) -> &AudioTrackHandle {
        &self.tracks
    }

    /// Open a new peer with `credential`, replacing any existing one.
    ///
    /// Resolves with the new generation once the peer is live. If it is not
    /// live within `timeout`, a `connection.timeout` event is emitted and
    /// [`ConnectionError::Timeout`] returned.
    pub async fn connect(
        &self,
        credential: &EphemeralCredential,
        timeout: Duration,
    ) -> ConnectionResult<u64> {
        if credential.is_expired() {
            warn!("Refusing to connect with an expired credential");
            return Err(ConnectionError::CredentialExpired);
        }

        self.disconnect().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = self.factory.create();
        *self.peer.lock() = Some(backend.clone());
        let events = PeerEventSink::new(generation, self.sink.clone());

        info!(generation, timeout_ms = timeout.as_millis() as u64, "Connecting transport");

        match tokio::time::timeout(timeout, backend.open(credential, events.clone())).await {
            Ok(Ok(())) => {
                backend.set_output_muted(self.tracks.output_muted());
                info!(generation, "Transport connected");
                Ok(generation)
            }
            Ok(Err(e)) => {
                warn!(generation, error = %e, "Transport negotiation failed");
                if let ConnectionError::IceFailed(reason) = &e {
                    events.emit(PeerEvent::IceFailed(reason.clone()));
                }
                self.disconnect().await;
                Err(e)
            }
            Err(_) => {
                let after_ms = timeout.as_millis() as u64;
                warn!(generation, after_ms, "Transport connection timed out");
                events.emit(PeerEvent::ConnectTimeout);
                self.disconnect().await;
                Err(ConnectionError::Timeout { after_ms })
            }
        }
    }

    /// Close the live peer, if any. Idempotent.
    pub async fn disconnect(&self) {
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            let stale = self.generation.fetch_add(1, Ordering::SeqCst);
            debug!(generation = stale, "Closing transport");
            peer.close().await;
        }
    }

    /// Acquire the microphone and start forwarding its events.
    ///
    /// The track starts disabled. Calling this again while a track is held is a no-op.
    pub async fn setup_microphone(&self) -> ConnectionResult<()> {
        if self.tracks.microphone_acquired() {
            return Ok(());
        }

        let mut track = match self.microphone.acquire().await {
            Ok(track) => track,
            Err(e) => {
                let reason = match &e {
                    ConnectionError::MicrophoneDenied(reason) => reason.clone(),
                    other => other.to_string(),
                };
                warn!(reason = %reason, "Microphone access denied");
                (self.sink)(TransportEvent::Device(DeviceEvent::MicrophoneDenied(reason.clone())));
                return Err(ConnectionError::MicrophoneDenied(reason));
            }
        };

        self.tracks.input_enabled.store(false, Ordering::SeqCst);
        self.tracks.microphone_acquired.store(true, Ordering::SeqCst);
        info!("Microphone acquired");

        let tracks = self.tracks.clone();
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = track.recv().await {
                let event = match signal {
                    MicrophoneSignal::Chunk(chunk) => {
                        if !tracks.input_enabled() {
                            continue;
                        }
                        DeviceEvent::Chunk(chunk)
                    }
                    MicrophoneSignal::Muted => DeviceEvent::TrackMuted,
                    MicrophoneSignal::Unmuted => DeviceEvent::TrackUnmuted,
                    MicrophoneSignal::Ended => break,
                };
                sink(TransportEvent::Device(event));
            }
            tracks.microphone_acquired.store(false, Ordering::SeqCst);
            tracks.input_enabled.store(false, Ordering::SeqCst);
            sink(TransportEvent::Device(DeviceEvent::TrackEnded));
        });
        *self.microphone_task.lock() = Some(task);
        Ok(())
    }

    /// Stop forwarding microphone events and release the track.
    pub fn release_microphone(&self) {
        if let Some(task) = self.microphone_task.lock().take() {
            task.abort();
        }
        self.tracks.microphone_acquired.store(false, Ordering::SeqCst);
        self.tracks.input_enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable_input(&self) {
        if !self.tracks.input_enabled.swap(true, Ordering::SeqCst) {
            debug!("Microphone input enabled");
        }
    }

    pub fn disable_input(&self) {
        if self.tracks.input_enabled.swap(false, Ordering::SeqCst) {
            debug!("Microphone input disabled");
        }
    }

    pub fn mute_output(&self) {
        self.set_output_muted(true);
    }

    pub fn unmute_output(&self) {
        self.set_output_muted(false);
    }

    fn set_output_muted(&self, muted: bool) {
        let was = self.tracks.output_muted.swap(muted, Ordering::SeqCst);
        if was != muted {
            debug!(muted, "Remote playback mute changed");
        }
        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            peer.set_output_muted(muted);
        }
    }

    fn live_peer(&self) -> ConnectionResult<Arc<dyn PeerBackend>> {
        self.peer.lock().clone().ok_or(ConnectionError::NotConnected)
    }

    /// Send a client event on the data channel.
    pub async fn send_event(&self, event: &ClientEvent) -> ConnectionResult<()> {
        let peer = self.live_peer()?;
        let frame = event
            .to_json()
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        debug!(event_type = event.event_type(), "Sending client event");

        tokio::time::timeout(self.send_timeout, peer.send_frame(frame))
            .await
            .map_err(|_| {
                ConnectionError::SendFailed(format!(
                    "{} not sent within {}ms",
                    event.event_type(),
                    self.send_timeout.as_millis()
                ))
            })?
    }

    /// Send one audio chunk on the outbound track.
    pub async fn send_audio(&self, chunk: Bytes) -> ConnectionResult<()> {
        let peer = self.live_peer()?;
        tokio::time::timeout(self.send_timeout, peer.send_audio(chunk))
            .await
            .map_err(|_| {
                ConnectionError::SendFailed(format!(
                    "audio chunk not sent within {}ms",
                    self.send_timeout.as_millis()
                ))
            })?
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if let Some(task) = self.microphone_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        transport: TransportConnection,
        remote: LoopbackRemote,
        events: Arc<Mutex<Vec<TransportEvent>>>,
        mic: tokio::sync::mpsc::Sender<MicrophoneSignal>,
    }

    fn harness() -> Harness {
        let (factory, remote) = LoopbackFactory::pair();
        let (microphone, mic) = ChannelMicrophone::pair();
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |event| captured.lock().push(event));
        Harness {
            transport: TransportConnection::new(Arc::new(factory), Arc::new(microphone), sink),
            remote,
            events,
            mic,
        }
    }

    fn credential() -> EphemeralCredential {
        EphemeralCredential::new("ek_test", None)
    }

    #[tokio::test]
    async fn test_reconnect_replaces_peer() {
        let h = harness();
        let first = h.transport.connect(&credential(), DEFAULT_CONNECT_TIMEOUT).await.unwrap();
        let second = h.transport.connect(&credential(), DEFAULT_CONNECT_TIMEOUT).await.unwrap();

        assert!(second > first);
        assert_eq!(h.remote.live_peers(), 1);
        assert_eq!(h.remote.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_emits_event() {
        let h = harness();
        h.remote.hang_opens(true);

        let err = h
            .transport
            .connect(&credential(), Duration::from_secs(15))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Timeout { after_ms: 15000 });
        assert!(!h.transport.is_connected());
        assert!(
            h.events
                .lock()
                .iter()
                .any(|event| event.name() == "connection.timeout")
        );
    }

    #[tokio::test]
    async fn test_expired_credential_refused() {
        let h = harness();
        let expired = EphemeralCredential::with_unix_expiry("ek_old", Some(1));
        assert_eq!(
            h.transport.connect(&expired, DEFAULT_CONNECT_TIMEOUT).await,
            Err(ConnectionError::CredentialExpired)
        );
        assert_eq!(h.remote.opens(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = harness();
        h.transport.disconnect().await;
        h.transport.connect(&credential(), DEFAULT_CONNECT_TIMEOUT).await.unwrap();
        h.transport.disconnect().await;
        h.transport.disconnect().await;
        assert_eq!(h.remote.live_peers(), 0);
        assert_eq!(
            h.transport.send_event(&ClientEvent::ResponseCancel).await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_microphone_gated_by_input_flag() {
        let h = harness();
        h.transport.setup_microphone().await.unwrap();
        assert!(!h.transport.tracks().input_enabled());

        h.mic
            .send(MicrophoneSignal::Chunk(Bytes::from_static(b"dropped")))
            .await
            .unwrap();
        h.mic.send(MicrophoneSignal::Muted).await.unwrap();
        for _ in 0..50 {
            if !h.events.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        h.transport.enable_input();
        h.mic
            .send(MicrophoneSignal::Chunk(Bytes::from_static(b"kept")))
            .await
            .unwrap();
        h.mic.send(MicrophoneSignal::Ended).await.unwrap();

        for _ in 0..50 {
            if h.events.lock().iter().any(|e| e.name() == "track.ended") {
                break;
            }
            tokio::task::yield_now().await;
        }

        let names: Vec<&str> = h.events.lock().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["track.muted", "audio.chunk", "track.ended"]);
        assert!(!h.transport.tracks().microphone_acquired());
    }

    #[tokio::test]
    async fn test_microphone_denied_emits_event() {
        let (factory, _remote) = LoopbackFactory::pair();
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |event| captured.lock().push(event));
        let transport = TransportConnection::new(
            Arc::new(factory),
            Arc::new(ChannelMicrophone::denied("blocked by user")),
            sink,
        );

        assert_eq!(
            transport.setup_microphone().await,
            Err(ConnectionError::MicrophoneDenied("blocked by user".to_string()))
        );
        assert_eq!(events.lock()[0].name(), "microphone.denied");
    }

    #[tokio::test]
    async fn test_output_mute_reaches_peer() {
        let h = harness();
        h.transport.mute_output();
        h.transport.connect(&credential(), DEFAULT_CONNECT_TIMEOUT).await.unwrap();
        assert!(h.remote.output_muted());

        h.transport.unmute_output();
        assert!(!h.remote.output_muted());
        assert!(!h.transport.tracks().output_muted());
    }
}
