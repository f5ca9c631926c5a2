//! In-memory peer connection.
//!
//! Stands in for the remote model when no network is wanted: the offline
//! simulator and the test suites drive sessions through it. The
//! [`LoopbackRemote`] side injects server frames, drops connections, fails or
//! stalls negotiation, and records everything the session sent.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::peer::{PeerBackend, PeerEvent, PeerEventSink, PeerFactory};
use super::signaling::EphemeralCredential;
use crate::errors::{ConnectionError, ConnectionResult};

struct Shared {
    current: Mutex<Option<PeerEventSink>>,
    frames: Mutex<Vec<String>>,
    frame_tx: mpsc::UnboundedSender<String>,
    frame_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    credentials: Mutex<Vec<String>>,
    fail_opens: AtomicU32,
    fail_audio: AtomicU32,
    hang_opens: AtomicBool,
    open_delay_ms: AtomicI64,
    auto_ack: AtomicBool,
    announce_session: AtomicBool,
    opens: AtomicU32,
    live_peers: AtomicI64,
    audio_sent: AtomicUsize,
    output_muted: AtomicBool,
    mute_observer: Mutex<Option<MuteObserver>>,
}

/// Called with the new value each time a peer's playback mute is set.
pub type MuteObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Creates loopback peers that share one remote.
#[derive(Clone)]
pub struct LoopbackFactory {
    shared: Arc<Shared>,
}

impl LoopbackFactory {
    /// A factory and the remote controlling its peers.
    pub fn pair() -> (Self, LoopbackRemote) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            frames: Mutex::new(Vec::new()),
            frame_tx,
            frame_rx: tokio::sync::Mutex::new(frame_rx),
            credentials: Mutex::new(Vec::new()),
            fail_opens: AtomicU32::new(0),
            fail_audio: AtomicU32::new(0),
            hang_opens: AtomicBool::new(false),
            open_delay_ms: AtomicI64::new(0),
            auto_ack: AtomicBool::new(true),
            announce_session: AtomicBool::new(true),
            opens: AtomicU32::new(0),
            live_peers: AtomicI64::new(0),
            audio_sent: AtomicUsize::new(0),
            output_muted: AtomicBool::new(false),
            mute_observer: Mutex::new(None),
        });
        (
            Self {
                shared: shared.clone(),
            },
            LoopbackRemote { shared },
        )
    }
}

impl PeerFactory for LoopbackFactory {
    fn create(&self) -> Arc<dyn PeerBackend> {
        Arc::new(LoopbackPeer {
            shared: self.shared.clone(),
            sink: Mutex::new(None),
            open: AtomicBool::new(false),
        })
    }
}

struct LoopbackPeer {
    shared: Arc<Shared>,
    sink: Mutex<Option<PeerEventSink>>,
    open: AtomicBool,
}

impl LoopbackPeer {
    fn ensure_open(&self) -> ConnectionResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }
}

#[async_trait]
impl PeerBackend for LoopbackPeer {
    async fn open(&self, credential: &EphemeralCredential, events: PeerEventSink) -> ConnectionResult<()> {
        let attempt = self.shared.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .credentials
            .lock()
            .push(credential.secret().to_string());

        if self.shared.hang_opens.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let delay = self.shared.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let failing = self
            .shared
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(attempt, "Loopback open failing on request");
            return Err(ConnectionError::IceFailed("loopback negotiation refused".to_string()));
        }

        self.open.store(true, Ordering::SeqCst);
        self.shared.live_peers.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock() = Some(events.clone());
        *self.shared.current.lock() = Some(events.clone());

        events.emit(PeerEvent::Opened);
        if self.shared.announce_session.load(Ordering::SeqCst) {
            let frame = json!({
                "type": "session.created",
                "session": { "id": format!("sess_loopback_{attempt}") }
            });
            events.emit(PeerEvent::Frame(frame.to_string()));
        }
        Ok(())
    }

    async fn send_frame(&self, frame: String) -> ConnectionResult<()> {
        self.ensure_open()?;
        self.shared.frames.lock().push(frame.clone());
        let _ = self.shared.frame_tx.send(frame);
        Ok(())
    }

    async fn send_audio(&self, _chunk: Bytes) -> ConnectionResult<()> {
        self.ensure_open()?;
        if self
            .shared
            .fail_audio
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectionError::SendFailed("loopback track refused chunk".to_string()));
        }
        self.shared.audio_sent.fetch_add(1, Ordering::SeqCst);
        if self.shared.auto_ack.load(Ordering::SeqCst)
            && let Some(sink) = self.sink.lock().as_ref()
        {
            sink.emit(PeerEvent::AudioAck);
        }
        Ok(())
    }

    fn set_output_muted(&self, muted: bool) {
        self.shared.output_muted.store(muted, Ordering::SeqCst);
        let observer = self.shared.mute_observer.lock().clone();
        if let Some(observer) = observer {
            observer(muted);
        }
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shared.live_peers.fetch_sub(1, Ordering::SeqCst);
            let closed = self.sink.lock().take();
            let mut current = self.shared.current.lock();
            if let (Some(closed), Some(live)) = (closed, current.as_ref())
                && closed.generation() == live.generation()
            {
                *current = None;
            }
        }
    }
}

/// Remote end of the loopback peers.
#[derive(Clone)]
pub struct LoopbackRemote {
    shared: Arc<Shared>,
}

impl LoopbackRemote {
    fn emit(&self, event: PeerEvent) -> bool {
        match self.shared.current.lock().as_ref() {
            Some(sink) => {
                sink.emit(event);
                true
            }
            None => false,
        }
    }

    /// Deliver a server frame to the live peer. Returns `false` when none is live.
    pub fn inject(&self, frame: impl Into<String>) -> bool {
        self.emit(PeerEvent::Frame(frame.into()))
    }

    pub fn inject_json(&self, frame: serde_json::Value) -> bool {
        self.inject(frame.to_string())
    }

    /// Simulate the network dropping the live connection.
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.emit(PeerEvent::Closed {
            reason: reason.to_string(),
        })
    }

    /// Simulate ICE failing on the live connection.
    pub fn fail_ice(&self, reason: &str) -> bool {
        self.emit(PeerEvent::IceFailed(reason.to_string()))
    }

    /// Acknowledge `count` audio chunks on the live peer.
    pub fn ack_audio(&self, count: usize) {
        for _ in 0..count {
            self.emit(PeerEvent::AudioAck);
        }
    }

    /// Make the next `count` negotiations fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` audio sends fail.
    pub fn fail_next_audio(&self, count: u32) {
        self.shared.fail_audio.store(count, Ordering::SeqCst);
    }

    /// Make negotiations never complete.
    pub fn hang_opens(&self, hang: bool) {
        self.shared.hang_opens.store(hang, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.shared
            .open_delay_ms
            .store(delay.as_millis() as i64, Ordering::SeqCst);
    }

    /// Acknowledge audio as soon as it is sent (default on).
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Send `session.created` when a peer opens (default on).
    pub fn set_announce_session(&self, enabled: bool) {
        self.shared.announce_session.store(enabled, Ordering::SeqCst);
    }

    /// Every frame the session sent, oldest first.
    pub fn sent_frames(&self) -> Vec<String> {
        self.shared.frames.lock().clone()
    }

    /// Sent frames parsed as JSON.
    pub fn sent_events(&self) -> Vec<serde_json::Value> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    /// Number of sent frames with the given `type`.
    pub fn count_sent(&self, event_type: &str) -> usize {
        self.sent_events()
            .iter()
            .filter(|event| event["type"] == event_type)
            .count()
    }

    /// Wait for the next sent frame of `event_type`, skipping others.
    pub async fn next_sent(&self, event_type: &str) -> Option<serde_json::Value> {
        let mut rx = self.shared.frame_rx.lock().await;
        while let Some(frame) = rx.recv().await {
            if let Ok(event) = serde_json::from_str::<serde_json::Value>(&frame)
                && event["type"] == event_type
            {
                return Some(event);
            }
        }
        None
    }

    /// Credentials presented to each negotiation.
    pub fn credentials_used(&self) -> Vec<String> {
        self.shared.credentials.lock().clone()
    }

    pub fn opens(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Peers currently open.
    pub fn live_peers(&self) -> i64 {
        self.shared.live_peers.load(Ordering::SeqCst)
    }

    pub fn audio_chunks_sent(&self) -> usize {
        self.shared.audio_sent.load(Ordering::SeqCst)
    }

    pub fn output_muted(&self) -> bool {
        self.shared.output_muted.load(Ordering::SeqCst)
    }

    /// Watch playback mute changes as the session makes them.
    pub fn set_mute_observer(&self, observer: MuteObserver) {
        *self.shared.mute_observer.lock() = Some(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::peer::{EventSink, TransportEvent};

    fn capture() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        (Arc::new(move |event| captured.lock().push(event)), seen)
    }

    #[tokio::test]
    async fn test_open_announces_session() {
        let (factory, remote) = LoopbackFactory::pair();
        let (sink, seen) = capture();
        let peer = factory.create();

        peer.open(&EphemeralCredential::new("ek_1", None), PeerEventSink::new(1, sink))
            .await
            .unwrap();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "connection.opened");
        assert_eq!(remote.live_peers(), 1);
        assert_eq!(remote.credentials_used(), vec!["ek_1".to_string()]);

        peer.close().await;
        peer.close().await;
        assert_eq!(remote.live_peers(), 0);
        assert!(!remote.inject("{}"));
    }

    #[tokio::test]
    async fn test_failed_opens_then_success() {
        let (factory, remote) = LoopbackFactory::pair();
        remote.fail_next_opens(1);
        let credential = EphemeralCredential::new("ek", None);

        let (sink, _) = capture();
        let first = factory.create();
        assert!(matches!(
            first.open(&credential, PeerEventSink::new(1, sink.clone())).await,
            Err(ConnectionError::IceFailed(_))
        ));
        assert!(first.send_frame("{}".to_string()).await.is_err());

        let second = factory.create();
        second.open(&credential, PeerEventSink::new(2, sink)).await.unwrap();
        second.send_frame(r#"{"type":"response.cancel"}"#.to_string()).await.unwrap();
        assert_eq!(remote.count_sent("response.cancel"), 1);
        assert_eq!(remote.opens(), 2);
    }

    #[tokio::test]
    async fn test_audio_auto_ack() {
        let (factory, remote) = LoopbackFactory::pair();
        remote.set_announce_session(false);
        let (sink, seen) = capture();
        let peer = factory.create();
        peer.open(&EphemeralCredential::new("ek", None), PeerEventSink::new(3, sink))
            .await
            .unwrap();

        peer.send_audio(Bytes::from_static(&[0xFF; 160])).await.unwrap();
        remote.set_auto_ack(false);
        peer.send_audio(Bytes::from_static(&[0xFF; 160])).await.unwrap();

        let acks = seen
            .lock()
            .iter()
            .filter(|event| event.name() == "audio.ack")
            .count();
        assert_eq!(acks, 1);
        assert_eq!(remote.audio_chunks_sent(), 2);
    }
}
