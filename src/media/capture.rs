use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::DeviceError;
use crate::media::{LocalTrack, TrackKind};

/// A running capture device and the track it feeds.
///
/// Dropping the source stops the device.
pub struct CaptureSource {
    track: LocalTrack,
    ended: Option<oneshot::Receiver<()>>,
    stopper: Option<std::sync::Mutex<Box<dyn FnOnce() + Send>>>,
}

impl CaptureSource {
    pub fn new(track: LocalTrack) -> Self {
        Self {
            track,
            ended: None,
            stopper: None,
        }
    }

    /// Run `stop` when the source is released.
    pub fn with_stopper(mut self, stop: impl FnOnce() + Send + 'static) -> Self {
        self.stopper = Some(std::sync::Mutex::new(Box::new(stop)));
        self
    }

    /// Signal that fires (or is dropped) when the device stops producing on
    /// its own, e.g. the OS "stop sharing" button.
    pub fn with_end_signal(mut self, ended: oneshot::Receiver<()>) -> Self {
        self.ended = Some(ended);
        self
    }

    pub fn track(&self) -> &LocalTrack {
        &self.track
    }

    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }

    pub(crate) fn take_end_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ended.take()
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        if let Some(stop) = self.stopper.take() {
            let stop = stop.into_inner().unwrap_or_else(|e| e.into_inner());
            stop();
        }
    }
}

/// Opens local capture devices. Acquisition may take a while (permission
/// prompts, device warm-up) and always runs off the session loop.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureSource, DeviceError>;
}

/// Backend for builds without device support; every acquisition fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCaptureBackend;

#[async_trait]
impl CaptureBackend for NullCaptureBackend {
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureSource, DeviceError> {
        Err(DeviceError::Unsupported(kind))
    }
}
