//! WebRTC peer built on webrtc-rs.
//!
//! One outbound PCMU track carries microphone audio, the `oai-events` data
//! channel carries JSON frames both ways, and the SDP offer/answer goes through
//! [`SdpSignaling`]. Remote audio is drained; playback belongs to the caller.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::microphone::FRAME_INTERVAL;
use super::peer::{PeerBackend, PeerEvent, PeerEventSink, PeerFactory};
use super::signaling::{EphemeralCredential, SdpSignaling};
use crate::errors::{ConnectionError, ConnectionResult};

/// Data channel label the realtime endpoint expects.
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Pending,
    Open,
    Failed(String),
}

/// Creates webrtc-rs peers that signal through one endpoint.
#[derive(Clone)]
pub struct WebRtcPeerFactory {
    signaling: SdpSignaling,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(signaling: SdpSignaling) -> Self {
        Self {
            signaling,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls;
        self
    }
}

impl PeerFactory for WebRtcPeerFactory {
    fn create(&self) -> Arc<dyn PeerBackend> {
        Arc::new(WebRtcPeer {
            signaling: self.signaling.clone(),
            ice_servers: self.ice_servers.clone(),
            inner: Mutex::new(None),
            output_muted: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Clone)]
struct Connected {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    track: Arc<TrackLocalStaticSample>,
    events: PeerEventSink,
}

struct WebRtcPeer {
    signaling: SdpSignaling,
    ice_servers: Vec<String>,
    inner: Mutex<Option<Connected>>,
    output_muted: Arc<AtomicBool>,
    closed: AtomicBool,
}

fn ice_error(e: webrtc::Error) -> ConnectionError {
    ConnectionError::IceFailed(e.to_string())
}

impl WebRtcPeer {
    fn connected(&self) -> ConnectionResult<Connected> {
        self.inner.lock().clone().ok_or(ConnectionError::NotConnected)
    }

    async fn build_connection(&self) -> ConnectionResult<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(ice_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(ice_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(config).await.map_err(ice_error)?))
    }
}

#[async_trait]
impl PeerBackend for WebRtcPeer {
    async fn open(&self, credential: &EphemeralCredential, events: PeerEventSink) -> ConnectionResult<()> {
        let pc = self.build_connection().await?;
        let (link_tx, mut link_rx) = watch::channel(LinkState::Pending);
        let link_tx = Arc::new(link_tx);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "voice-order".to_owned(),
        ));
        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(ice_error)?;

        let channel = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(ice_error)?;

        let open_tx = link_tx.clone();
        channel.on_open(Box::new(move || {
            let _ = open_tx.send(LinkState::Open);
            Box::pin(async {})
        }));

        let frame_events = events.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            match String::from_utf8(message.data.to_vec()) {
                Ok(frame) => frame_events.emit(PeerEvent::Frame(frame)),
                Err(e) => warn!(error = %e, "Dropping non-UTF-8 data channel message"),
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let state_tx = link_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Peer connection state changed");
            match state {
                RTCPeerConnectionState::Failed => {
                    let reason = "peer connection failed".to_string();
                    if *state_tx.borrow() == LinkState::Pending {
                        let _ = state_tx.send(LinkState::Failed(reason));
                    } else {
                        state_events.emit(PeerEvent::IceFailed(reason));
                    }
                }
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    if *state_tx.borrow() == LinkState::Open {
                        state_events.emit(PeerEvent::Closed {
                            reason: state.to_string(),
                        });
                    }
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let muted = self.output_muted.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let muted = muted.clone();
            tokio::spawn(async move {
                let mut dropped = 0u64;
                while let Ok((_packet, _)) = remote.read_rtp().await {
                    if muted.load(Ordering::SeqCst) {
                        dropped += 1;
                    }
                }
                debug!(dropped, "Remote audio track ended");
            });
            Box::pin(async {})
        }));

        let offer = pc.create_offer(None).await.map_err(ice_error)?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.map_err(ice_error)?;
        let _ = gathered.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| ConnectionError::Signaling("no local description".to_string()))?;

        let answer_sdp = self.signaling.exchange(&local.sdp, credential).await?;
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| ConnectionError::Signaling(e.to_string()))?;
        pc.set_remote_description(answer).await.map_err(ice_error)?;

        let outcome = link_rx
            .wait_for(|state| *state != LinkState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| ConnectionError::IceFailed("negotiation abandoned".to_string()))?;
        if let LinkState::Failed(reason) = outcome {
            let _ = pc.close().await;
            return Err(ConnectionError::IceFailed(reason));
        }

        if self.closed.load(Ordering::SeqCst) {
            let _ = pc.close().await;
            return Err(ConnectionError::NotConnected);
        }

        *self.inner.lock() = Some(Connected {
            pc,
            channel,
            track,
            events: events.clone(),
        });
        info!(generation = events.generation(), "WebRTC peer connected");
        events.emit(PeerEvent::Opened);
        Ok(())
    }

    async fn send_frame(&self, frame: String) -> ConnectionResult<()> {
        let connected = self.connected()?;
        connected
            .channel
            .send_text(frame)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    async fn send_audio(&self, chunk: Bytes) -> ConnectionResult<()> {
        let connected = self.connected()?;
        let sample = Sample {
            data: chunk,
            duration: FRAME_INTERVAL,
            ..Default::default()
        };
        connected
            .track
            .write_sample(&sample)
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        connected.events.emit(PeerEvent::AudioAck);
        Ok(())
    }

    fn set_output_muted(&self, muted: bool) {
        self.output_muted.store(muted, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connected = self.inner.lock().take();
        if let Some(connected) = connected {
            if let Err(e) = tokio::time::timeout(Duration::from_secs(2), connected.pc.close()).await {
                warn!(error = %e, "WebRTC close timed out");
            }
            debug!(generation = connected.events.generation(), "WebRTC peer closed");
        }
    }
}
