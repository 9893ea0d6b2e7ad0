use bytes::Bytes;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info};

use super::RunFlag;
use crate::error::DeviceError;
use crate::media::TrackKind;

/// ~15 fps.
const FRAME_INTERVAL: std::time::Duration = std::time::Duration::from_millis(66);

fn failed(reason: String) -> DeviceError {
    DeviceError::Failed {
        kind: TrackKind::Camera,
        reason,
    }
}

/// Open a camera at 640x480 and publish JPEG frames on `frames`. `ended`
/// is dropped when the thread exits, including when the camera goes away.
pub(super) fn start(
    index: Option<u32>,
    frames: broadcast::Sender<Bytes>,
    ended: oneshot::Sender<()>,
) -> Result<RunFlag, DeviceError> {
    let flag = RunFlag::new();
    let running = flag.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();

    std::thread::spawn(move || {
        let _ended = ended;
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
            Resolution::new(640, 480),
            FrameFormat::MJPEG,
            15,
        )));

        let mut camera = match Camera::new(CameraIndex::Index(index.unwrap_or(0)), requested) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready_tx.send(Err(DeviceError::NotFound(TrackKind::Camera)));
                error!("Failed to open camera: {}", e);
                return;
            }
        };
        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(failed(format!("Failed to open camera stream: {e}"))));
            return;
        }

        info!("Camera started: {}", camera.info().human_name());
        let _ = ready_tx.send(Ok(()));

        while running.is_running() {
            let frame = match camera.frame() {
                Ok(frame) => frame,
                Err(e) => {
                    if running.is_running() {
                        error!("Camera frame error: {}", e);
                    }
                    break;
                }
            };
            match frame.decode_image::<RgbFormat>() {
                Ok(rgb) => {
                    let mut jpeg = Vec::new();
                    let mut cursor = std::io::Cursor::new(&mut jpeg);
                    match rgb.write_to(&mut cursor, image::ImageFormat::Jpeg) {
                        Ok(()) => {
                            let _ = frames.send(Bytes::from(jpeg));
                        }
                        Err(e) => error!("JPEG encode failed: {}", e),
                    }
                }
                Err(e) => error!("Frame decode failed: {}", e),
            }
            std::thread::sleep(FRAME_INTERVAL);
        }

        drop(camera);
        info!("Camera stopped");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(flag),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(failed("camera thread exited".to_string())),
    }
}
