use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::PeerError;
use crate::media::{opus_track, LocalTrack, OutgoingTracks, TrackKind};
use crate::models::ParticipantId;
use crate::peer::{
    LinkContext, NegotiationRole, PeerConnector, PeerEvent, PeerTransport, RemoteTrackHandle,
    TransportState,
};

/// Data channel carrying camera and screen frames.
const FRAME_CHANNEL_LABEL: &str = "media-frames";
/// Max data channel message size (under 16KB SCTP limit).
const MAX_DC_MSG_SIZE: usize = 15000;
/// Chunk header: 'C' + original_type(1) + frame_id(4) + total_chunks(2) + chunk_index(2) = 10 bytes.
const CHUNK_HEADER_SIZE: usize = 10;
/// Max payload data per chunk.
const MAX_CHUNK_DATA: usize = MAX_DC_MSG_SIZE - CHUNK_HEADER_SIZE;

const CAMERA_FRAME: u8 = b'V';
const SCREEN_FRAME: u8 = b'S';
const CHUNKED_FRAME: u8 = b'C';

fn frame_type_byte(kind: TrackKind) -> u8 {
    match kind {
        TrackKind::Screen => SCREEN_FRAME,
        _ => CAMERA_FRAME,
    }
}

fn frame_kind(type_byte: u8) -> Option<TrackKind> {
    match type_byte {
        CAMERA_FRAME => Some(TrackKind::Camera),
        SCREEN_FRAME => Some(TrackKind::Screen),
        _ => None,
    }
}

/// Split one JPEG frame into data channel messages. Small frames go out as
/// `type + data`; larger ones are chunked under `frame_id`.
fn encode_frame(type_byte: u8, jpeg: &[u8], frame_id: u32) -> Vec<Bytes> {
    if 1 + jpeg.len() <= MAX_DC_MSG_SIZE {
        let mut msg = Vec::with_capacity(1 + jpeg.len());
        msg.push(type_byte);
        msg.extend_from_slice(jpeg);
        return vec![Bytes::from(msg)];
    }

    let total_chunks = jpeg.len().div_ceil(MAX_CHUNK_DATA) as u16;
    jpeg.chunks(MAX_CHUNK_DATA)
        .enumerate()
        .map(|(index, chunk)| {
            let mut msg = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk.len());
            msg.push(CHUNKED_FRAME);
            msg.push(type_byte);
            msg.extend_from_slice(&frame_id.to_le_bytes());
            msg.extend_from_slice(&total_chunks.to_le_bytes());
            msg.extend_from_slice(&(index as u16).to_le_bytes());
            msg.extend_from_slice(chunk);
            Bytes::from(msg)
        })
        .collect()
}

/// Reassembles chunked frames from one remote participant.
#[derive(Default)]
struct ChunkAssembler {
    /// (frame_type, frame_id) -> (total_chunks, received_chunks)
    pending: HashMap<(u8, u32), (u16, HashMap<u16, Vec<u8>>)>,
}

impl ChunkAssembler {
    /// Feed one data channel message; returns a frame once it is complete.
    fn accept(&mut self, msg: &[u8]) -> Option<(TrackKind, Vec<u8>)> {
        let (&type_byte, rest) = msg.split_first()?;
        if type_byte != CHUNKED_FRAME {
            return frame_kind(type_byte).map(|kind| (kind, rest.to_vec()));
        }
        if msg.len() < CHUNK_HEADER_SIZE {
            return None;
        }
        let frame_type = msg[1];
        let frame_id = u32::from_le_bytes([msg[2], msg[3], msg[4], msg[5]]);
        let total_chunks = u16::from_le_bytes([msg[6], msg[7]]);
        let chunk_index = u16::from_le_bytes([msg[8], msg[9]]);

        self.cleanup(frame_type, frame_id);
        let full = self.add_chunk(frame_type, frame_id, total_chunks, chunk_index, msg[CHUNK_HEADER_SIZE..].to_vec())?;
        frame_kind(frame_type).map(|kind| (kind, full))
    }

    fn add_chunk(&mut self, frame_type: u8, frame_id: u32, total_chunks: u16, chunk_index: u16, data: Vec<u8>) -> Option<Vec<u8>> {
        let key = (frame_type, frame_id);
        let entry = self.pending.entry(key).or_insert_with(|| (total_chunks, HashMap::new()));
        entry.1.insert(chunk_index, data);
        if entry.1.len() < entry.0 as usize {
            return None;
        }

        let (total, chunks) = self.pending.remove(&key)?;
        let mut full = Vec::new();
        for i in 0..total {
            if let Some(chunk) = chunks.get(&i) {
                full.extend_from_slice(chunk);
            }
        }
        Some(full)
    }

    /// Discard stale partial frames (keep only the last 4 frame ids per type).
    fn cleanup(&mut self, frame_type: u8, current_frame_id: u32) {
        self.pending
            .retain(|k, _| k.0 != frame_type || current_frame_id.wrapping_sub(k.1) < 4);
    }
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn invalid(e: serde_json::Error) -> PeerError {
    PeerError::InvalidPayload(e.to_string())
}

/// Builds `webrtc` peer connections: Opus audio over RTP and camera/screen
/// frames over the `media-frames` data channel.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ])
    }
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn build_api(&self) -> Result<API, PeerError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, ctx: LinkContext) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let LinkContext {
            participant_id,
            generation,
            role,
            tracks,
            events,
        } = ctx;

        let pc = Arc::new(self.build_api()?.new_peer_connection(self.configuration()).await?);

        // The audio sender always exists so the track can be swapped later
        // without renegotiation; the placeholder is never written to.
        let placeholder = opus_track("meshmeet-silence");
        let audio = tracks
            .audio
            .as_ref()
            .and_then(LocalTrack::rtp_track)
            .unwrap_or_else(|| placeholder.clone());
        let audio_sender = pc
            .add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        let rtcp_sender = audio_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let frames = Arc::new(FrameChannel::default());
        register_callbacks(&pc, &participant_id, generation, &events, &frames);

        let transport = WebRtcTransport {
            participant_id: participant_id.clone(),
            generation,
            events,
            pc,
            audio_sender,
            placeholder,
            frames,
            video_pump: Mutex::new(None),
        };
        if role == NegotiationRole::Initiator {
            transport.open_frame_channel().await?;
        }
        transport.restart_video_pump(tracks.video.as_ref()).await;

        info!(participant = %participant_id, generation, ?role, "Created WebRTC peer connection");
        Ok(Arc::new(transport))
    }
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    participant_id: &ParticipantId,
    generation: u64,
    events: &mpsc::Sender<PeerEvent>,
    frames: &Arc<FrameChannel>,
) {
    let tx = events.clone();
    let pid = participant_id.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let pid = pid.clone();
        Box::pin(async move {
            info!("WebRTC connection to {} state: {}", pid, state);
            let _ = tx
                .send(PeerEvent::StateChanged {
                    participant_id: pid,
                    generation,
                    state: transport_state(state),
                })
                .await;
        })
    }));

    let tx = events.clone();
    let pid = participant_id.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        let pid = pid.clone();
        Box::pin(async move {
            info!("Received remote {} track from {}", track.kind(), pid);
            let _ = tx
                .send(PeerEvent::RemoteTrack {
                    participant_id: pid,
                    generation,
                    track: RemoteTrackHandle(track),
                })
                .await;
        })
    }));

    let tx = events.clone();
    let pid = participant_id.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        let pid = pid.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let json = match candidate.to_json().map(|init| serde_json::to_value(init)) {
                Ok(Ok(json)) => json,
                Ok(Err(e)) => {
                    warn!("Failed to serialize ICE candidate: {}", e);
                    return;
                }
                Err(e) => {
                    warn!("Failed to serialize ICE candidate: {}", e);
                    return;
                }
            };
            let _ = tx
                .send(PeerEvent::LocalCandidate {
                    participant_id: pid,
                    generation,
                    candidate: json,
                })
                .await;
        })
    }));

    // Answerer receives the frame channel from the offerer
    let tx = events.clone();
    let pid = participant_id.clone();
    let frames = frames.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let tx = tx.clone();
        let pid = pid.clone();
        let frames = frames.clone();
        Box::pin(async move {
            debug!("Received data channel '{}' from {}", dc.label(), pid);
            if dc.label() == FRAME_CHANNEL_LABEL {
                frames.attach(&pid, generation, &tx, dc).await;
            }
        })
    }));
}

/// The link's frame data channel, set once by whichever side gets it first.
#[derive(Default)]
struct FrameChannel {
    dc: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl FrameChannel {
    async fn current(&self) -> Option<Arc<RTCDataChannel>> {
        self.dc.lock().await.clone()
    }

    async fn attach(
        &self,
        participant_id: &ParticipantId,
        generation: u64,
        events: &mpsc::Sender<PeerEvent>,
        dc: Arc<RTCDataChannel>,
    ) {
        let tx = events.clone();
        let pid = participant_id.clone();
        let assembler = Arc::new(Mutex::new(ChunkAssembler::default()));
        dc.on_message(Box::new(move |msg| {
            let tx = tx.clone();
            let pid = pid.clone();
            let assembler = assembler.clone();
            Box::pin(async move {
                let frame = assembler.lock().await.accept(&msg.data);
                if let Some((kind, data)) = frame {
                    let _ = tx
                        .send(PeerEvent::RemoteFrame {
                            participant_id: pid,
                            generation,
                            kind,
                            data: Bytes::from(data),
                        })
                        .await;
                }
            })
        }));
        *self.dc.lock().await = Some(dc);
    }
}

pub struct WebRtcTransport {
    participant_id: ParticipantId,
    generation: u64,
    events: mpsc::Sender<PeerEvent>,
    pc: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    placeholder: Arc<TrackLocalStaticSample>,
    frames: Arc<FrameChannel>,
    video_pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcTransport {
    /// Create the frame channel unless one is already attached. The offering
    /// side owns it, so every offer must carry it.
    async fn open_frame_channel(&self) -> Result<(), PeerError> {
        if self.frames.current().await.is_some() {
            return Ok(());
        }
        let dc = self.pc.create_data_channel(FRAME_CHANNEL_LABEL, None).await?;
        self.frames
            .attach(&self.participant_id, self.generation, &self.events, dc)
            .await;
        Ok(())
    }

    /// Forward frames from `video` to the data channel, replacing any
    /// previous forwarder.
    async fn restart_video_pump(&self, video: Option<&LocalTrack>) {
        let mut pump = self.video_pump.lock().await;
        if let Some(handle) = pump.take() {
            handle.abort();
        }
        let Some(track) = video else {
            return;
        };
        let Some(mut rx) = track.subscribe_frames() else {
            return;
        };

        let type_byte = frame_type_byte(track.kind());
        let frames = self.frames.clone();
        let pid = self.participant_id.clone();
        *pump = Some(tokio::spawn(async move {
            let mut frame_id: u32 = 0;
            loop {
                match rx.recv().await {
                    Ok(jpeg) => {
                        let Some(dc) = frames.current().await else {
                            continue;
                        };
                        for msg in encode_frame(type_byte, &jpeg, frame_id) {
                            if let Err(e) = dc.send(&msg).await {
                                debug!("Failed to send frame to {}: {}", pid, e);
                                break;
                            }
                        }
                        frame_id = frame_id.wrapping_add(1);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Frame forwarder for {} skipped {} frames", pid, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    async fn description(&self, desc: RTCSessionDescription) -> Result<Value, PeerError> {
        self.pc.set_local_description(desc.clone()).await?;
        serde_json::to_value(&desc).map_err(invalid)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        self.open_frame_channel().await?;
        let offer = self.pc.create_offer(None).await?;
        self.description(offer).await
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.description(answer).await
    }

    async fn set_remote_description(&self, sdp: Value) -> Result<(), PeerError> {
        let desc: RTCSessionDescription = serde_json::from_value(sdp).map_err(invalid)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(invalid)?;
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &OutgoingTracks) -> Result<(), PeerError> {
        let audio = tracks
            .audio
            .as_ref()
            .and_then(LocalTrack::rtp_track)
            .unwrap_or_else(|| self.placeholder.clone());
        self.audio_sender
            .replace_track(Some(audio as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        self.restart_video_pump(tracks.video.as_ref()).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(handle) = self.video_pump.lock().await.take() {
            handle.abort();
        }
        self.pc.close().await?;
        info!("Closed peer connection to {}", self.participant_id);
        Ok(())
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.video_pump.get_mut().take() {
            handle.abort();
        }
    }
}
