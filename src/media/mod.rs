pub mod capture;
pub mod controller;
#[cfg(feature = "capture")]
pub mod devices;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// The three independent local sources. Camera and screen share the single
/// outgoing video slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Camera,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackKind::Audio => "audio",
            TrackKind::Camera => "camera",
            TrackKind::Screen => "screen",
        };
        f.write_str(name)
    }
}

/// Where a local track's media comes from.
#[derive(Clone)]
pub enum TrackSource {
    /// Opus samples written straight to an RTP track.
    Rtp(Arc<TrackLocalStaticSample>),
    /// Encoded JPEG frames, fanned out to every link's frame data channel.
    Frames(broadcast::Sender<Bytes>),
    /// Produces nothing. Used where no real device exists.
    Silent,
}

/// A live local track. Cloning shares the same source; only the media
/// controller creates or stops the underlying device.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn rtp_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        match &self.source {
            TrackSource::Rtp(track) => Some(track.clone()),
            _ => None,
        }
    }

    pub fn subscribe_frames(&self) -> Option<broadcast::Receiver<Bytes>> {
        match &self.source {
            TrackSource::Frames(tx) => Some(tx.subscribe()),
            _ => None,
        }
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// What every peer link should currently be sending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingTracks {
    pub audio: Option<LocalTrack>,
    /// Screen while sharing, otherwise camera.
    pub video: Option<LocalTrack>,
}

/// Create an Opus RTP track suitable for the peer connection's audio sender.
pub fn opus_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        "audio".to_string(),
        stream_id.to_string(),
    ))
}
