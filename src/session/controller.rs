use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventSender, LeaveReason, SessionEvent};
use crate::media::controller::{MediaContext, MediaEvent, MediaStateController};
use crate::media::TrackKind;
use crate::models::{MediaFlags, SessionSnapshot, SessionState};
use crate::peer::{ManagerConfig, NegotiationRole, PeerConnectionManager, PeerEvent};
use crate::presence::{PresenceReconciler, PresenceSnapshot, PresenceStore};
use crate::roster::Roster;
use crate::signaling::{ChannelIdentity, SignalingChannel, SignalingEnvelope, SignalingStatus};

use super::{SessionCommand, SessionDeps};

const PEER_EVENT_BUFFER: usize = 256;
const SNAPSHOT_BUFFER: usize = 4;

/// Owns every per-meeting component. Runs on a single task, so roster and
/// link mutations are serialized.
pub(super) struct SessionActor {
    config: SessionConfig,
    state: SessionState,
    events: EventSender,
    state_tx: watch::Sender<SessionSnapshot>,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,

    presence: Arc<dyn PresenceStore>,
    reconciler: Arc<PresenceReconciler>,
    snapshots: mpsc::Receiver<PresenceSnapshot>,
    ticker: Option<(JoinHandle<()>, CancellationToken)>,

    signaling: Option<SignalingChannel>,
    signaling_rx: mpsc::Receiver<SignalingEnvelope>,
    signaling_status: watch::Receiver<SignalingStatus>,

    peers: PeerConnectionManager,
    peer_events: mpsc::Receiver<PeerEvent>,

    media: MediaStateController,
    media_events: mpsc::Receiver<MediaEvent>,
}

impl SessionActor {
    /// Run the startup sequence. Any error here aborts the join; whatever
    /// was already registered is released on a best-effort basis.
    #[instrument(skip_all, name = "session.start", fields(meeting = %config.meeting_id, participant = %config.participant_id))]
    pub(super) async fn start(
        config: SessionConfig,
        deps: SessionDeps,
        events: EventSender,
        state_tx: watch::Sender<SessionSnapshot>,
        commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let _ = events.send(SessionEvent::StateChanged(SessionState::Joining));

        let meeting_id = config.meeting_id.clone();
        let local_id = config.participant_id.clone();
        let display_name = config.display_name();

        if let Err(e) = deps
            .presence
            .join(&meeting_id, &local_id, &display_name, MediaFlags::default())
            .await
        {
            return Err(abort_startup(&events, &state_tx, e.into()));
        }
        info!("Attendance registered");

        let reconciler = Arc::new(PresenceReconciler::new(
            deps.presence.clone(),
            meeting_id.clone(),
            local_id.clone(),
        ));
        let seed = match reconciler.poll(&Roster::default()).await {
            Ok(diff) => diff,
            Err(e) => {
                release_attendance(deps.presence.as_ref(), &config).await;
                return Err(abort_startup(&events, &state_tx, e.into()));
            }
        };
        debug!(present = seed.joined.len(), "Seed poll complete");

        let (flags_tx, flags_rx) = watch::channel(MediaFlags::default());
        let identity = ChannelIdentity {
            meeting_id: meeting_id.clone(),
            participant_id: local_id.clone(),
            display_name: config.display_name.clone(),
        };
        let (signaling, signaling_rx) = match SignalingChannel::connect(
            deps.signaling.clone(),
            identity,
            config.reconnect,
            flags_rx,
            cancel.child_token(),
        )
        .await
        {
            Ok(opened) => opened,
            Err(e) => {
                release_attendance(deps.presence.as_ref(), &config).await;
                return Err(abort_startup(&events, &state_tx, e.into()));
            }
        };
        let signaling_status = signaling.status();

        let (peer_tx, peer_events) = mpsc::channel(PEER_EVENT_BUFFER);
        let mut peers = PeerConnectionManager::new(
            ManagerConfig {
                meeting_id: meeting_id.clone(),
                local_id: local_id.clone(),
                max_peers: config.max_peers,
            },
            deps.peers.clone(),
            signaling.sender(),
            events.clone(),
            peer_tx,
        );

        let (mut media, media_events) = MediaStateController::new(MediaContext {
            meeting_id: meeting_id.clone(),
            local_id: local_id.clone(),
            backend: deps.capture.clone(),
            presence: deps.presence.clone(),
            signaling: signaling.sender(),
            events: events.clone(),
            flags: flags_tx,
            cancel: cancel.child_token(),
        });

        // Device failures leave the session joined without that source.
        if config.initial_audio {
            let _ = media.acquire_initial(TrackKind::Audio).await;
        }
        if config.initial_video {
            let _ = media.acquire_initial(TrackKind::Camera).await;
        }
        media.publish(&mut peers).await;

        for participant in seed.joined {
            peers
                .on_participant_joined(participant, NegotiationRole::Responder)
                .await;
        }

        let (snapshot_tx, snapshots) = mpsc::channel(SNAPSHOT_BUFFER);
        let ticker_cancel = cancel.child_token();
        let ticker = reconciler
            .clone()
            .spawn_ticker(config.poll_interval, snapshot_tx, ticker_cancel.clone());

        let mut actor = Self {
            config,
            state: SessionState::Joining,
            events,
            state_tx,
            commands,
            cancel,
            presence: deps.presence,
            reconciler,
            snapshots,
            ticker: Some((ticker, ticker_cancel)),
            signaling: Some(signaling),
            signaling_rx,
            signaling_status,
            peers,
            peer_events,
            media,
            media_events,
        };
        actor.set_state(SessionState::Active);
        info!(peers = actor.peers.roster().len(), "Session active");
        Ok(actor)
    }

    #[instrument(skip_all, name = "session", fields(meeting = %self.config.meeting_id, participant = %self.config.participant_id))]
    pub(super) async fn run(mut self) {
        let leave_reply = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Session cancelled");
                    break None;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Leave { respond_to }) => break Some(respond_to),
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All session handles dropped");
                            break None;
                        }
                    }
                }

                Some(envelope) = self.signaling_rx.recv() => {
                    self.peers.on_signaling_envelope(envelope).await;
                }

                Some(event) = self.peer_events.recv() => {
                    self.peers.on_transport_event(event).await;
                }

                Some(snapshot) = self.snapshots.recv() => {
                    self.on_snapshot(snapshot).await;
                }

                Some(event) = self.media_events.recv() => {
                    self.media.on_event(event, &mut self.peers).await;
                }

                Ok(()) = self.signaling_status.changed() => {
                    let status = self.signaling_status.borrow_and_update().clone();
                    self.on_signaling_status(status);
                }
            }

            self.publish_snapshot();
        };

        self.teardown().await;
        if let Some(reply) = leave_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetMedia {
                kind,
                enabled,
                respond_to,
            } => {
                self.media
                    .set_enabled(kind, enabled, Some(respond_to), &mut self.peers)
                    .await;
            }
            SessionCommand::SetHandRaised { raised, respond_to } => {
                self.media.set_hand_raised(raised).await;
                let _ = respond_to.send(());
            }
            SessionCommand::Leave { respond_to } => {
                // Handled by the loop itself.
                let _ = respond_to.send(());
            }
        }
    }

    /// Attendance is authoritative: its joins and leaves go through the same
    /// handlers signaling uses.
    async fn on_snapshot(&mut self, snapshot: PresenceSnapshot) {
        let diff = self.reconciler.reconcile(snapshot, self.peers.roster());
        if diff.is_empty() {
            return;
        }
        debug!(
            joined = diff.joined.len(),
            left = diff.left.len(),
            updated = diff.updated.len(),
            "Reconciling roster"
        );

        for id in diff.left {
            self.peers.on_participant_left(&id, LeaveReason::Reconciliation).await;
        }
        for participant in diff.joined {
            self.peers
                .on_participant_joined(participant, NegotiationRole::Initiator)
                .await;
        }
        for participant in diff.updated {
            self.peers.apply_update(participant);
        }
    }

    fn on_signaling_status(&mut self, status: SignalingStatus) {
        match &status {
            SignalingStatus::Reconnecting { attempt } => {
                warn!(attempt, "Signaling connection lost, reconnecting")
            }
            SignalingStatus::Reconnected => info!("Signaling reconnected"),
            SignalingStatus::GaveUp => {
                warn!("Signaling gave up reconnecting; attendance polling keeps the roster current")
            }
            SignalingStatus::Connected | SignalingStatus::Closed => {}
        }
        let _ = self.events.send(SessionEvent::Signaling(status));
    }

    /// Every step runs even if an earlier one failed.
    async fn teardown(&mut self) {
        self.set_state(SessionState::Leaving);
        info!("Leaving meeting");

        release_attendance(self.presence.as_ref(), &self.config).await;

        self.peers.close_all().await;

        if let Some((ticker, ticker_cancel)) = self.ticker.take() {
            ticker_cancel.cancel();
            if let Err(e) = ticker.await {
                warn!("Presence ticker ended abnormally: {}", e);
            }
        }

        if let Some(signaling) = self.signaling.take() {
            signaling.close().await;
        }

        self.media.shutdown();

        self.set_state(SessionState::Closed);
        info!("Session closed");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        let _ = self.events.send(SessionEvent::StateChanged(state));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = SessionSnapshot {
            meeting_id: self.config.meeting_id.clone(),
            participant_id: self.config.participant_id.clone(),
            is_organizer: self.config.is_organizer,
            state: self.state,
            media: self.media.flags(),
            screen_sharing: self.media.screen_sharing(),
            participants: self.peers.roster().ids(),
            connected_peers: self.peers.connected_peers(),
        };
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

/// Record a failed start on the bus and the state watch, and hand the error
/// back.
fn abort_startup(
    events: &EventSender,
    state_tx: &watch::Sender<SessionSnapshot>,
    error: SessionError,
) -> SessionError {
    warn!("Session startup failed: {}", error);
    let _ = events.send(SessionEvent::StateChanged(SessionState::Closed));
    state_tx.send_modify(|snapshot| snapshot.state = SessionState::Closed);
    error
}

async fn release_attendance(presence: &dyn PresenceStore, config: &SessionConfig) {
    if let Err(e) = presence
        .leave(&config.meeting_id, &config.participant_id)
        .await
    {
        warn!("Failed to release attendance: {}", e);
    }
}
