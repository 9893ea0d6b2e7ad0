use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::RunFlag;
use crate::error::DeviceError;
use crate::media::TrackKind;

/// 20ms at 48kHz mono.
const FRAME_SAMPLES: usize = 960;

fn failed(reason: impl Into<String>) -> DeviceError {
    DeviceError::Failed {
        kind: TrackKind::Audio,
        reason: reason.into(),
    }
}

/// Opus encoder: 48kHz mono, 20ms frames.
pub(super) struct OpusEncoder {
    encoder: opus::Encoder,
}

impl OpusEncoder {
    pub(super) fn new() -> Result<Self, DeviceError> {
        let encoder = opus::Encoder::new(48000, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| failed(format!("Failed to create Opus encoder: {e}")))?;
        Ok(Self { encoder })
    }

    pub(super) fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, opus::Error> {
        let mut output = vec![0u8; 4000];
        let len = self.encoder.encode_float(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }
}

/// Open the default input device. The cpal stream is not `Send`, so it is
/// built and kept on a dedicated thread until the flag is cleared.
pub(super) fn start() -> Result<(RunFlag, mpsc::Receiver<Vec<f32>>), DeviceError> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
    let flag = RunFlag::new();
    let running = flag.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();

    std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err(DeviceError::NotFound(TrackKind::Audio)));
            return;
        };
        info!("Using input device: {}", device.name().unwrap_or_else(|_| "unknown".into()));

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_flag = running.clone();
        let mut buffer = Vec::with_capacity(FRAME_SAMPLES);
        let stream = match device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !callback_flag.is_running() {
                    return;
                }
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == FRAME_SAMPLES {
                        let _ = tx.try_send(std::mem::replace(&mut buffer, Vec::with_capacity(FRAME_SAMPLES)));
                    }
                }
            },
            move |err| error!("Audio capture error: {}", err),
            None,
        ) {
            Ok(stream) => stream,
            Err(cpal::BuildStreamError::DeviceNotAvailable) => {
                let _ = ready_tx.send(Err(DeviceError::NotFound(TrackKind::Audio)));
                return;
            }
            Err(e) => {
                let _ = ready_tx.send(Err(failed(format!("Failed to build input stream: {e}"))));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(failed(format!("Failed to start capture: {e}"))));
            return;
        }

        info!("Audio capture started (48kHz mono, 20ms frames)");
        let _ = ready_tx.send(Ok(()));

        while running.is_running() {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(stream);
        info!("Audio capture stopped");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((flag, rx)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(failed("audio capture thread exited")),
    }
}
