//! Real capture devices: cpal microphone with Opus encoding, nokhwa camera
//! and an ffmpeg screen grab. Every device runs on its own thread and is
//! stopped through a shared run flag.

mod camera;
mod microphone;
mod screen;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;
use webrtc::media::Sample;

use crate::error::DeviceError;
use crate::media::capture::{CaptureBackend, CaptureSource};
use crate::media::{opus_track, LocalTrack, TrackKind, TrackSource};

/// Frames buffered per subscriber before the slowest link starts skipping.
const FRAME_BUFFER: usize = 4;

/// Cleared to stop a device thread.
#[derive(Debug, Clone)]
struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Opens the host's default devices.
#[derive(Debug, Default, Clone)]
pub struct DeviceCaptureBackend {
    camera_index: Option<u32>,
}

impl DeviceCaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(index: u32) -> Self {
        Self {
            camera_index: Some(index),
        }
    }

    async fn microphone(&self) -> Result<CaptureSource, DeviceError> {
        let (flag, mut pcm) = run_blocking(TrackKind::Audio, microphone::start).await?;
        let mut encoder = match microphone::OpusEncoder::new() {
            Ok(encoder) => encoder,
            Err(e) => {
                flag.stop();
                return Err(e);
            }
        };

        let track = opus_track("meshmeet-audio");
        let writer = track.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = pcm.recv().await {
                let data = match encoder.encode(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("Opus encode failed: {}", e);
                        continue;
                    }
                };
                let sample = Sample {
                    data: data.into(),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(e) = writer.write_sample(&sample).await {
                    debug!("Failed to write audio sample: {}", e);
                }
            }
        });

        Ok(
            CaptureSource::new(LocalTrack::new(TrackKind::Audio, TrackSource::Rtp(track))).with_stopper(
                move || {
                    flag.stop();
                    pump.abort();
                },
            ),
        )
    }

    async fn frames(&self, kind: TrackKind) -> Result<CaptureSource, DeviceError> {
        let (frames, _) = broadcast::channel::<Bytes>(FRAME_BUFFER);
        let (ended_tx, ended) = oneshot::channel();
        let sink = frames.clone();
        let camera_index = self.camera_index;

        let flag = match kind {
            TrackKind::Camera => {
                run_blocking(kind, move || camera::start(camera_index, sink, ended_tx)).await?
            }
            _ => run_blocking(kind, move || screen::start(sink, ended_tx)).await?,
        };

        Ok(CaptureSource::new(LocalTrack::new(kind, TrackSource::Frames(frames)))
            .with_end_signal(ended)
            .with_stopper(move || flag.stop()))
    }
}

/// Device start-up blocks (permission prompts, warm-up), so it runs on the
/// blocking pool.
async fn run_blocking<T, F>(kind: TrackKind, start: F) -> Result<T, DeviceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
{
    tokio::task::spawn_blocking(start)
        .await
        .map_err(|e| DeviceError::Failed {
            kind,
            reason: format!("device thread failed: {e}"),
        })?
}

#[async_trait]
impl CaptureBackend for DeviceCaptureBackend {
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureSource, DeviceError> {
        match kind {
            TrackKind::Audio => self.microphone().await,
            TrackKind::Camera | TrackKind::Screen => self.frames(kind).await,
        }
    }
}
