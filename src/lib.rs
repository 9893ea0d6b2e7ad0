//! Full-mesh WebRTC meeting sessions.
//!
//! A [`SessionHandle`] joins a meeting: it registers attendance, opens the
//! signaling channel to the relay and keeps one direct peer link per remote
//! participant. [`relay`] is a small development server that forwards
//! signaling and serves attendance.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod peer;
pub mod presence;
pub mod relay;
pub mod roster;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{RelayConfig, SessionConfig};
pub use error::{DeviceError, PeerError, PresenceError, SessionError, SignalingError};
pub use events::{LeaveReason, SessionEvent};
pub use models::{MediaFlags, MeetingId, Participant, ParticipantId, SessionSnapshot, SessionState};
pub use session::{SessionDeps, SessionHandle};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info`
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
