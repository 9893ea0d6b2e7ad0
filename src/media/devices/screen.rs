use std::io::Read;
use std::process::{Child, Command, Stdio};

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::RunFlag;
use crate::error::DeviceError;
use crate::media::TrackKind;

fn failed(reason: String) -> DeviceError {
    DeviceError::Failed {
        kind: TrackKind::Screen,
        reason,
    }
}

/// Grab the whole screen with ffmpeg at 10 fps, scaled to 1280x720, and
/// publish JPEG frames on `frames`. `ended` is dropped when ffmpeg exits.
pub(super) fn start(frames: broadcast::Sender<Bytes>, ended: oneshot::Sender<()>) -> Result<RunFlag, DeviceError> {
    let ffmpeg = find_ffmpeg().ok_or(DeviceError::Unsupported(TrackKind::Screen))?;

    let mut cmd = Command::new(&ffmpeg);
    input_args(&mut cmd);
    cmd.args([
        "-vf",
        "scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2",
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-q:v",
        "5",
        "-r",
        "10",
        "pipe:1",
    ]);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| failed(format!("Failed to start ffmpeg: {e}")))?;
    if let Some(stderr) = child.stderr.take() {
        std::thread::spawn(move || {
            use std::io::BufRead;
            for line in std::io::BufReader::new(stderr).lines().map_while(Result::ok) {
                debug!("ffmpeg: {}", line);
            }
        });
    }

    let flag = RunFlag::new();
    let running = flag.clone();
    std::thread::spawn(move || {
        let _ended = ended;
        pump_frames(&mut child, &running, &frames);
        let _ = child.kill();
        let _ = child.wait();
        info!("Screen capture stopped");
    });

    info!("Screen capture started via {}", ffmpeg);
    Ok(flag)
}

fn pump_frames(child: &mut Child, running: &RunFlag, frames: &broadcast::Sender<Bytes>) {
    let Some(mut stdout) = child.stdout.take() else {
        error!("ffmpeg stdout unavailable");
        return;
    };
    let mut buf = vec![0u8; 256 * 1024];
    let mut pending = Vec::with_capacity(256 * 1024);

    while running.is_running() {
        match stdout.read(&mut buf) {
            Ok(0) => {
                if let Ok(status) = child.wait() {
                    if !status.success() {
                        warn!("ffmpeg exited with status: {}", status);
                    }
                }
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(frame) = extract_jpeg_frame(&mut pending) {
                    let _ = frames.send(Bytes::from(frame));
                }
            }
            Err(e) => {
                if running.is_running() {
                    error!("ffmpeg read error: {}", e);
                }
                return;
            }
        }
    }
}

fn find_ffmpeg() -> Option<String> {
    let mut candidates = vec!["ffmpeg".to_string()];
    if cfg!(target_os = "windows") {
        candidates.push(r"C:\ffmpeg\bin\ffmpeg.exe".to_string());
        candidates.push(r"C:\Program Files\ffmpeg\bin\ffmpeg.exe".to_string());
    } else {
        candidates.push("/usr/bin/ffmpeg".to_string());
        candidates.push("/usr/local/bin/ffmpeg".to_string());
        candidates.push("/opt/homebrew/bin/ffmpeg".to_string());
    }

    candidates.into_iter().find(|candidate| {
        Command::new(candidate)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    })
}

#[cfg(target_os = "linux")]
fn input_args(cmd: &mut Command) {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
    let (width, height) = screen_resolution().unwrap_or((1920, 1080));
    let size = format!("{width}x{height}");
    info!("Capturing {} on {}", size, display);
    cmd.args(["-f", "x11grab", "-framerate", "10", "-video_size", &size, "-i", &display]);
}

#[cfg(target_os = "windows")]
fn input_args(cmd: &mut Command) {
    cmd.args(["-f", "gdigrab", "-framerate", "10", "-i", "desktop"]);
}

#[cfg(target_os = "macos")]
fn input_args(cmd: &mut Command) {
    cmd.args([
        "-f",
        "avfoundation",
        "-framerate",
        "10",
        "-capture_cursor",
        "1",
        "-i",
        "Capture screen 0:",
    ]);
}

/// Screen size from `xdpyinfo`.
#[cfg(target_os = "linux")]
fn screen_resolution() -> Option<(u32, u32)> {
    let output = Command::new("xdpyinfo")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let dims = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("dimensions:"))?
        .split_whitespace()
        .nth(1)?;
    let (w, h) = dims.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Cut the first complete JPEG (SOI `FF D8` to EOI `FF D9`) out of `buf`,
/// discarding anything before it.
fn extract_jpeg_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = buf.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end_offset = buf[start + 2..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    let end = start + 2 + end_offset + 2;

    let frame = buf[start..end].to_vec();
    buf.drain(..end);
    Some(frame)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_frames_are_cut_at_markers() {
        let mut buf = vec![0x00, 0xFF, 0xD8, 1, 2, 0xFF, 0xD9, 0xFF, 0xD8, 3];
        let frame = extract_jpeg_frame(&mut buf).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        assert_eq!(buf, vec![0xFF, 0xD8, 3]);
        assert!(extract_jpeg_frame(&mut buf).is_none());
    }
}
