use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use meshmeet::config::{RelayConfig, SessionConfig, DEFAULT_PORT};
use meshmeet::media::capture::CaptureBackend;
use meshmeet::peer::webrtc::WebRtcConnector;
use meshmeet::presence::{HttpPresenceStore, MemoryPresenceStore};
use meshmeet::relay::{self, RelayState};
use meshmeet::signaling::{ReconnectPolicy, WsConnector};
use meshmeet::{SessionDeps, SessionEvent, SessionHandle};

#[derive(Parser)]
#[command(name = "meshmeet", about = "Mesh WebRTC meetings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay and in-memory attendance service
    Relay {
        /// Address to listen on
        #[arg(long, env = "MESHMEET_BIND", default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
        bind: SocketAddr,

        /// Milliseconds a dropped client has to reconnect before its
        /// departure is announced
        #[arg(long, env = "MESHMEET_DEPARTURE_GRACE_MS", default_value_t = 5000)]
        departure_grace_ms: u64,
    },
    /// Join a meeting
    Join(JoinArgs),
}

#[derive(Args)]
struct JoinArgs {
    /// Signaling WebSocket URL
    #[arg(long, env = "MESHMEET_RELAY_URL", default_value = "ws://127.0.0.1:9847/ws")]
    relay_url: String,

    /// Attendance service base URL
    #[arg(long, env = "MESHMEET_PRESENCE_URL", default_value = "http://127.0.0.1:9847")]
    presence_url: String,

    #[arg(long, env = "MESHMEET_MEETING")]
    meeting: String,

    #[arg(long, env = "MESHMEET_PARTICIPANT")]
    participant: String,

    #[arg(long, env = "MESHMEET_DISPLAY_NAME")]
    display_name: Option<String>,

    #[arg(long)]
    organizer: bool,

    /// Join muted
    #[arg(long = "no-audio")]
    no_audio: bool,

    /// Start with the camera on
    #[arg(long)]
    video: bool,

    /// STUN/TURN server URL; repeat for several
    #[arg(long = "stun")]
    stun: Vec<String>,

    #[arg(long, default_value = "3")]
    reconnect_delay_secs: u64,

    #[arg(long, default_value = "20")]
    max_reconnect_attempts: u32,

    #[arg(long, default_value = "3")]
    poll_interval_secs: u64,

    /// Soft cap on simultaneous peer links
    #[arg(long, default_value = "8")]
    max_peers: usize,
}

impl JoinArgs {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            display_name: self.display_name.clone(),
            is_organizer: self.organizer,
            initial_audio: !self.no_audio,
            initial_video: self.video,
            reconnect: ReconnectPolicy::fixed(
                Duration::from_secs(self.reconnect_delay_secs),
                self.max_reconnect_attempts,
            ),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_peers: self.max_peers,
            ..SessionConfig::new(self.meeting.as_str(), self.participant.as_str())
        }
    }

    fn peer_connector(&self) -> WebRtcConnector {
        if self.stun.is_empty() {
            WebRtcConnector::default()
        } else {
            WebRtcConnector::new(self.stun.clone())
        }
    }
}

#[cfg(feature = "capture")]
fn capture_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(meshmeet::media::devices::DeviceCaptureBackend::new())
}

#[cfg(not(feature = "capture"))]
fn capture_backend() -> Arc<dyn CaptureBackend> {
    warn!("Built without the `capture` feature; joining without local media");
    Arc::new(meshmeet::media::capture::NullCaptureBackend)
}

async fn run_relay(config: RelayConfig) -> ExitCode {
    let state = RelayState::new(Arc::new(MemoryPresenceStore::new()));
    match relay::start_relay(config, state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_join(args: JoinArgs) -> ExitCode {
    let deps = SessionDeps {
        presence: Arc::new(HttpPresenceStore::new(args.presence_url.clone())),
        signaling: Arc::new(WsConnector::new(args.relay_url.clone())),
        peers: Arc::new(args.peer_connector()),
        capture: capture_backend(),
    };

    let session = match SessionHandle::start(args.session_config(), deps).await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to join meeting: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut events = session.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving");
                break;
            }
            _ = session.closed() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} session events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Err(e) = session.leave().await {
        error!("Leave failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => info!(%state, "Session state"),
        SessionEvent::ParticipantJoined(p) => info!(participant = %p.id, name = %p.display_name, "Joined"),
        SessionEvent::ParticipantUpdated(p) => debug!(
            participant = %p.id,
            audio = p.media.has_audio,
            video = p.media.has_video,
            hand = p.media.hand_raised,
            "Updated"
        ),
        SessionEvent::ParticipantLeft { participant_id, reason } => {
            info!(participant = %participant_id, ?reason, "Left")
        }
        SessionEvent::PeerStateChanged { participant_id, state } => {
            info!(participant = %participant_id, %state, "Peer link")
        }
        SessionEvent::RemoteTrack { participant_id, track } => {
            info!(participant = %participant_id, ?track, "Remote track")
        }
        SessionEvent::RemoteFrame { .. } => {}
        SessionEvent::LocalMediaChanged { media, screen_sharing } => info!(
            audio = media.has_audio,
            video = media.has_video,
            screen = screen_sharing,
            "Local media"
        ),
        SessionEvent::MediaError { kind, error } => warn!(%kind, "Media error: {}", error),
        SessionEvent::Signaling(status) => debug!(?status, "Signaling"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    meshmeet::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Relay {
            bind,
            departure_grace_ms,
        } => {
            run_relay(RelayConfig {
                bind,
                departure_grace: Duration::from_millis(departure_grace_ms),
            })
            .await
        }
        Command::Join(args) => run_join(args).await,
    }
}
