//! The session: one actor task that owns every component of a joined
//! meeting, and the cloneable handle the UI layers talk to.
//!
//! Startup runs inline in [`SessionHandle::start`] so its first failure is
//! returned to the caller. Once the session is `Active` the actor loop is
//! spawned and all further interaction goes through the handle.

mod controller;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{create_event_bus, EventReceiver, EventSender};
use crate::media::capture::CaptureBackend;
use crate::media::controller::MediaReply;
use crate::media::TrackKind;
use crate::models::{SessionSnapshot, SessionState};
use crate::peer::PeerConnector;
use crate::presence::PresenceStore;
use crate::signaling::Connector;

use controller::SessionActor;

const SESSION_CHANNEL_BUFFER: usize = 64;

/// External collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub presence: Arc<dyn PresenceStore>,
    pub signaling: Arc<dyn Connector>,
    pub peers: Arc<dyn PeerConnector>,
    pub capture: Arc<dyn CaptureBackend>,
}

/// Messages accepted by the session actor.
pub enum SessionCommand {
    SetMedia {
        kind: TrackKind,
        enabled: bool,
        respond_to: MediaReply,
    },
    SetHandRaised {
        raised: bool,
        respond_to: oneshot::Sender<()>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    events: EventSender,
    state: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Join a meeting. Returns once the session is `Active`, or with the
    /// first fatal startup error.
    pub async fn start(config: SessionConfig, deps: SessionDeps) -> Result<Self, SessionError> {
        let (events, _) = create_event_bus();
        Self::start_with_events(config, deps, events).await
    }

    /// Like [`start`](Self::start) on a caller-provided event bus, so
    /// startup events can be observed.
    pub async fn start_with_events(
        config: SessionConfig,
        deps: SessionDeps,
        events: EventSender,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (state_tx, state) = watch::channel(SessionSnapshot::new(
            config.meeting_id.clone(),
            config.participant_id.clone(),
            config.is_organizer,
        ));

        let actor = SessionActor::start(config, deps, events.clone(), state_tx, receiver, cancel.clone()).await?;
        tokio::spawn(actor.run());

        Ok(Self {
            sender,
            events,
            state,
            cancel,
        })
    }

    async fn set_media(&self, kind: TrackKind, enabled: bool) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SetMedia {
                kind,
                enabled,
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        rx.await.map_err(|_| SessionError::Closed)?.map_err(SessionError::from)
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_media(TrackKind::Audio, enabled).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_media(TrackKind::Camera, enabled).await
    }

    /// While sharing, the screen replaces the camera on every link.
    pub async fn set_screen_share(&self, enabled: bool) -> Result<(), SessionError> {
        self.set_media(TrackKind::Screen, enabled).await
    }

    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SetHandRaised { raised, respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;

        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Leave the meeting and wait for teardown to finish. Leaving a session
    /// that already stopped is a no-op.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Leave { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Tear down without waiting; [`closed`](Self::closed) resolves once it
    /// is done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the session reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.state == SessionState::Closed).await;
    }
}
