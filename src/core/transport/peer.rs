//! Peer connection seam and transport events.
//!
//! A [`PeerBackend`] is one peer connection attempt: it negotiates the media
//! and data path, carries JSON frames and audio, and reports what happens to it
//! as [`PeerEvent`]s. Every backend gets a [`PeerEventSink`] stamped with the
//! connection generation, so events from a replaced peer can be told apart
//! from the live one.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use super::signaling::EphemeralCredential;
use crate::errors::ConnectionResult;

/// Events reported by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Media and data path are live
    Opened,
    /// Connection closed
    Closed { reason: String },
    /// Connection was not live in time
    ConnectTimeout,
    /// ICE/DTLS negotiation failed
    IceFailed(String),
    /// JSON frame received on the data channel
    Frame(String),
    /// One outbound audio chunk finished sending
    AudioAck,
}

/// Events reported by the local microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    MicrophoneDenied(String),
    TrackMuted,
    TrackUnmuted,
    TrackEnded,
    /// Captured audio (G.711 μ-law, 20ms frames)
    Chunk(Bytes),
}

/// Everything the transport reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Peer { generation: u64, event: PeerEvent },
    Device(DeviceEvent),
}

impl TransportEvent {
    /// Wire-style name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Peer { event, .. } => match event {
                PeerEvent::Opened => "connection.opened",
                PeerEvent::Closed { .. } => "connection.closed",
                PeerEvent::ConnectTimeout => "connection.timeout",
                PeerEvent::IceFailed(_) => "ice.failed",
                PeerEvent::Frame(_) => "data.frame",
                PeerEvent::AudioAck => "audio.ack",
            },
            TransportEvent::Device(event) => match event {
                DeviceEvent::MicrophoneDenied(_) => "microphone.denied",
                DeviceEvent::TrackMuted => "track.muted",
                DeviceEvent::TrackUnmuted => "track.unmuted",
                DeviceEvent::TrackEnded => "track.ended",
                DeviceEvent::Chunk(_) => "audio.chunk",
            },
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Receives transport events. Must not block.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Event sink bound to one connection generation.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    sink: EventSink,
}

impl PeerEventSink {
    pub fn new(generation: u64, sink: EventSink) -> Self {
        Self { generation, sink }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.sink)(TransportEvent::Peer {
            generation: self.generation,
            event,
        });
    }
}

/// One peer connection.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Negotiate the connection. Resolves once the data and media path are live.
    async fn open(&self, credential: &EphemeralCredential, events: PeerEventSink) -> ConnectionResult<()>;

    /// Send a JSON frame on the data channel.
    async fn send_frame(&self, frame: String) -> ConnectionResult<()>;

    /// Send one audio chunk on the outbound track. Emits [`PeerEvent::AudioAck`] once written.
    async fn send_audio(&self, chunk: Bytes) -> ConnectionResult<()>;

    /// Mute or unmute remote playback.
    fn set_output_muted(&self, muted: bool);

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Creates a fresh backend for each connection attempt.
pub trait PeerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn PeerBackend>;
}
