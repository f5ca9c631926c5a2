//! Local microphone sources.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{ConnectionError, ConnectionResult};

/// Bytes in one 20ms frame of 8kHz G.711 μ-law audio.
pub const FRAME_BYTES: usize = 160;

/// Frame pacing interval.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

const TRACK_CHANNEL_CAPACITY: usize = 64;

/// What a microphone track reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MicrophoneSignal {
    Chunk(Bytes),
    Muted,
    Unmuted,
    /// Track stopped for good (device unplugged, permission revoked, end of input)
    Ended,
}

/// An acquired microphone track.
pub struct MicrophoneTrack {
    signals: mpsc::Receiver<MicrophoneSignal>,
}

impl MicrophoneTrack {
    pub fn new(signals: mpsc::Receiver<MicrophoneSignal>) -> Self {
        Self { signals }
    }

    /// Next signal; `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<MicrophoneSignal> {
        self.signals.recv().await
    }
}

/// Grants access to the local microphone.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the track. Fails with [`ConnectionError::MicrophoneDenied`] when access is refused.
    async fn acquire(&self) -> ConnectionResult<MicrophoneTrack>;
}

/// Microphone that streams raw μ-law audio from a file or pipe at real-time pace.
#[derive(Debug, Clone)]
pub struct ReaderMicrophone {
    path: PathBuf,
}

impl ReaderMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MicrophoneSource for ReaderMicrophone {
    async fn acquire(&self) -> ConnectionResult<MicrophoneTrack> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            ConnectionError::MicrophoneDenied(format!("{}: {e}", self.path.display()))
        })?;

        let (tx, rx) = mpsc::channel(TRACK_CHANNEL_CAPACITY);
        tokio::spawn(pump_frames(file, tx));
        Ok(MicrophoneTrack::new(rx))
    }
}

async fn pump_frames<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<MicrophoneSignal>) {
    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    let mut frame = vec![0u8; FRAME_BYTES];

    loop {
        interval.tick().await;
        let read = match reader.read(&mut frame).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Microphone read failed");
                break;
            }
        };
        if tx
            .send(MicrophoneSignal::Chunk(Bytes::copy_from_slice(&frame[..read])))
            .await
            .is_err()
        {
            return;
        }
    }

    debug!("Microphone input ended");
    let _ = tx.send(MicrophoneSignal::Ended).await;
}

/// Microphone driven by hand, for simulations and tests.
pub struct ChannelMicrophone {
    track: parking_lot::Mutex<Option<mpsc::Receiver<MicrophoneSignal>>>,
    deny: Option<String>,
}

impl ChannelMicrophone {
    /// A microphone and the sender that feeds it.
    pub fn pair() -> (Self, mpsc::Sender<MicrophoneSignal>) {
        let (tx, rx) = mpsc::channel(TRACK_CHANNEL_CAPACITY);
        (
            Self {
                track: parking_lot::Mutex::new(Some(rx)),
                deny: None,
            },
            tx,
        )
    }

    /// A microphone whose permission is always refused.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            track: parking_lot::Mutex::new(None),
            deny: Some(reason.into()),
        }
    }
}

#[async_trait]
impl MicrophoneSource for ChannelMicrophone {
    async fn acquire(&self) -> ConnectionResult<MicrophoneTrack> {
        if let Some(reason) = &self.deny {
            return Err(ConnectionError::MicrophoneDenied(reason.clone()));
        }
        self.track
            .lock()
            .take()
            .map(MicrophoneTrack::new)
            .ok_or_else(|| ConnectionError::MicrophoneDenied("track already acquired".to_string()))
    }
}
