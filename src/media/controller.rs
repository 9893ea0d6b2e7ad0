use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::events::{EventSender, SessionEvent};
use crate::media::capture::{CaptureBackend, CaptureSource};
use crate::media::{OutgoingTracks, TrackKind};
use crate::models::{MediaFlags, MeetingId, ParticipantId};
use crate::peer::PeerConnectionManager;
use crate::presence::PresenceStore;
use crate::signaling::{SignalingEnvelope, SignalingSender};

pub type MediaReply = oneshot::Sender<Result<(), DeviceError>>;

/// Outcomes of work the controller spawned, delivered back through the
/// session loop.
pub enum MediaEvent {
    Acquired {
        kind: TrackKind,
        result: Result<CaptureSource, DeviceError>,
    },
    /// A device stopped on its own.
    SourceEnded { kind: TrackKind, track_id: String },
}

pub struct MediaContext {
    pub meeting_id: MeetingId,
    pub local_id: ParticipantId,
    pub backend: Arc<dyn CaptureBackend>,
    pub presence: Arc<dyn PresenceStore>,
    pub signaling: SignalingSender,
    pub events: EventSender,
    pub flags: watch::Sender<MediaFlags>,
    pub cancel: CancellationToken,
}

struct PendingAcquisition {
    task: JoinHandle<()>,
    waiters: Vec<MediaReply>,
}

/// Sole owner of the local capture devices.
pub struct MediaStateController {
    ctx: MediaContext,
    media_events: mpsc::Sender<MediaEvent>,
    wanted: HashSet<TrackKind>,
    active: HashMap<TrackKind, CaptureSource>,
    pending: HashMap<TrackKind, PendingAcquisition>,
    hand_raised: bool,
}

impl MediaStateController {
    pub fn new(ctx: MediaContext) -> (Self, mpsc::Receiver<MediaEvent>) {
        let (media_events, rx) = mpsc::channel(32);
        let controller = Self {
            ctx,
            media_events,
            wanted: HashSet::new(),
            active: HashMap::new(),
            pending: HashMap::new(),
            hand_raised: false,
        };
        (controller, rx)
    }

    pub fn flags(&self) -> MediaFlags {
        MediaFlags {
            has_audio: self.active.contains_key(&TrackKind::Audio),
            has_video: self.active.contains_key(&TrackKind::Camera)
                || self.active.contains_key(&TrackKind::Screen),
            hand_raised: self.hand_raised,
        }
    }

    pub fn screen_sharing(&self) -> bool {
        self.active.contains_key(&TrackKind::Screen)
    }

    pub fn is_active(&self, kind: TrackKind) -> bool {
        self.active.contains_key(&kind)
    }

    pub fn is_pending(&self, kind: TrackKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Screen wins the video slot while it is shared.
    pub fn outgoing_tracks(&self) -> OutgoingTracks {
        let track = |kind| self.active.get(&kind).map(|s: &CaptureSource| s.track().clone());
        OutgoingTracks {
            audio: track(TrackKind::Audio),
            video: track(TrackKind::Screen).or_else(|| track(TrackKind::Camera)),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    /// Acquire a source inline. Only used during startup, before any link
    /// exists.
    pub async fn acquire_initial(&mut self, kind: TrackKind) -> Result<(), DeviceError> {
        self.wanted.insert(kind);
        let result = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(DeviceError::Cancelled),
            result = self.ctx.backend.acquire(kind) => result,
        };
        match result {
            Ok(source) => {
                info!(%kind, "Local source started");
                self.install(source);
                Ok(())
            }
            Err(e) => {
                warn!(%kind, "Device acquisition failed: {}", e);
                self.wanted.remove(&kind);
                self.emit(SessionEvent::MediaError {
                    kind,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Turn a source on or off. Enabling replies once the device is running
    /// (or failed); a request for a source already being acquired waits on
    /// that acquisition instead of starting another.
    pub async fn set_enabled(
        &mut self,
        kind: TrackKind,
        enabled: bool,
        reply: Option<MediaReply>,
        peers: &mut PeerConnectionManager,
    ) {
        if enabled {
            self.wanted.insert(kind);
            if self.active.contains_key(&kind) {
                respond(reply, Ok(()));
            } else if let Some(pending) = self.pending.get_mut(&kind) {
                debug!(%kind, "Joining pending acquisition");
                pending.waiters.extend(reply);
            } else {
                self.spawn_acquisition(kind, reply);
            }
            return;
        }

        self.wanted.remove(&kind);
        respond(reply, Ok(()));
        if let Some(source) = self.active.remove(&kind) {
            info!(%kind, "Local source stopped");
            drop(source);
            self.publish(peers).await;
        }
    }

    pub async fn set_hand_raised(&mut self, raised: bool) {
        if self.hand_raised == raised {
            return;
        }
        self.hand_raised = raised;
        self.publish_flags().await;
    }

    fn spawn_acquisition(&mut self, kind: TrackKind, reply: Option<MediaReply>) {
        let backend = self.ctx.backend.clone();
        let tx = self.media_events.clone();
        let cancel = self.ctx.cancel.clone();
        debug!(%kind, "Acquiring local source");
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(DeviceError::Cancelled),
                result = backend.acquire(kind) => result,
            };
            let _ = tx.send(MediaEvent::Acquired { kind, result }).await;
        });
        self.pending.insert(
            kind,
            PendingAcquisition {
                task,
                waiters: reply.into_iter().collect(),
            },
        );
    }

    pub async fn on_event(&mut self, event: MediaEvent, peers: &mut PeerConnectionManager) {
        match event {
            MediaEvent::Acquired { kind, result } => self.on_acquired(kind, result, peers).await,
            MediaEvent::SourceEnded { kind, track_id } => {
                self.on_source_ended(kind, &track_id, peers).await
            }
        }
    }

    async fn on_acquired(
        &mut self,
        kind: TrackKind,
        result: Result<CaptureSource, DeviceError>,
        peers: &mut PeerConnectionManager,
    ) {
        let waiters = self
            .pending
            .remove(&kind)
            .map(|p| p.waiters)
            .unwrap_or_default();

        match result {
            Ok(source) if self.wanted.contains(&kind) => {
                info!(%kind, "Local source started");
                self.install(source);
                self.publish(peers).await;
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Ok(_released) => {
                debug!(%kind, "Acquired source no longer wanted, releasing");
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(%kind, "Device acquisition failed: {}", e);
                self.wanted.remove(&kind);
                self.emit(SessionEvent::MediaError {
                    kind,
                    error: e.clone(),
                });
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    async fn on_source_ended(&mut self, kind: TrackKind, track_id: &str, peers: &mut PeerConnectionManager) {
        let current = self
            .active
            .get(&kind)
            .is_some_and(|source| source.track().id() == track_id);
        if !current {
            return;
        }
        info!(%kind, "Local source ended by the device");
        self.active.remove(&kind);
        self.wanted.remove(&kind);
        self.publish(peers).await;
    }

    fn install(&mut self, mut source: CaptureSource) {
        let kind = source.kind();
        if let Some(ended) = source.take_end_signal() {
            let tx = self.media_events.clone();
            let track_id = source.track().id().to_string();
            tokio::spawn(async move {
                let _ = ended.await;
                let _ = tx.send(MediaEvent::SourceEnded { kind, track_id }).await;
            });
        }
        self.active.insert(kind, source);
    }

    /// Push the current tracks to every link and announce the new state.
    pub async fn publish(&mut self, peers: &mut PeerConnectionManager) {
        peers.replace_tracks(self.outgoing_tracks()).await;
        self.publish_flags().await;
    }

    async fn publish_flags(&self) {
        let flags = self.flags();
        self.ctx.flags.send_replace(flags);
        self.emit(SessionEvent::LocalMediaChanged {
            media: flags,
            screen_sharing: self.screen_sharing(),
        });

        let update = SignalingEnvelope::media_update(
            self.ctx.meeting_id.clone(),
            self.ctx.local_id.clone(),
            flags,
        );
        if let Err(e) = self.ctx.signaling.send(update).await {
            warn!("Failed to queue media update: {}", e);
        }

        let presence = self.ctx.presence.clone();
        let meeting_id = self.ctx.meeting_id.clone();
        let local_id = self.ctx.local_id.clone();
        tokio::spawn(async move {
            if let Err(e) = presence.update_status(&meeting_id, &local_id, flags).await {
                warn!("Presence status update failed: {}", e);
            }
        });
    }

    /// Abort pending acquisitions and stop every device.
    pub fn shutdown(&mut self) {
        for (kind, pending) in self.pending.drain() {
            debug!(%kind, "Aborting pending acquisition");
            pending.task.abort();
            for waiter in pending.waiters {
                let _ = waiter.send(Err(DeviceError::Cancelled));
            }
        }
        self.active.clear();
        self.wanted.clear();
        self.hand_raised = false;
        self.ctx.flags.send_replace(MediaFlags::default());
    }
}

fn respond(reply: Option<MediaReply>, result: Result<(), DeviceError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;
    use crate::peer::{ManagerConfig, NegotiationRole};
    use crate::presence::MemoryPresenceStore;
    use crate::testing::{FakeCaptureBackend, FakePeerConnector};
    use chrono::Utc;
    use crate::models::Participant;

    struct Harness {
        media: MediaStateController,
        media_rx: mpsc::Receiver<MediaEvent>,
        peers: PeerConnectionManager,
        backend: FakeCaptureBackend,
        connector: FakePeerConnector,
        outbound: mpsc::Receiver<SignalingEnvelope>,
        flags: watch::Receiver<MediaFlags>,
    }

    fn harness() -> Harness {
        let backend = FakeCaptureBackend::new();
        let connector = FakePeerConnector::new();
        let (sig_tx, outbound) = mpsc::channel(64);
        let signaling = SignalingSender::new(sig_tx);
        let (events, _) = create_event_bus();
        let (peer_tx, _peer_rx) = mpsc::channel(16);
        let peers = PeerConnectionManager::new(
            ManagerConfig {
                meeting_id: "m1".into(),
                local_id: "alice".into(),
                max_peers: 8,
            },
            Arc::new(connector.clone()),
            signaling.clone(),
            events.clone(),
            peer_tx,
        );
        let (flags_tx, flags) = watch::channel(MediaFlags::default());
        let (media, media_rx) = MediaStateController::new(MediaContext {
            meeting_id: "m1".into(),
            local_id: "alice".into(),
            backend: Arc::new(backend.clone()),
            presence: Arc::new(MemoryPresenceStore::new()),
            signaling,
            events,
            flags: flags_tx,
            cancel: CancellationToken::new(),
        });
        Harness {
            media,
            media_rx,
            peers,
            backend,
            connector,
            outbound,
            flags,
        }
    }

    async fn pump_one(h: &mut Harness) {
        let event = h.media_rx.recv().await.unwrap();
        h.media.on_event(event, &mut h.peers).await;
    }

    #[tokio::test]
    async fn concurrent_enables_share_one_acquisition() {
        let mut h = harness();
        h.backend.hold(TrackKind::Camera);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        h.media.set_enabled(TrackKind::Camera, true, Some(tx1), &mut h.peers).await;
        h.media.set_enabled(TrackKind::Camera, false, None, &mut h.peers).await;
        h.media.set_enabled(TrackKind::Camera, true, Some(tx2), &mut h.peers).await;
        assert!(h.media.is_pending(TrackKind::Camera));

        h.backend.release(TrackKind::Camera);
        pump_one(&mut h).await;

        assert_eq!(h.backend.acquisitions(TrackKind::Camera), 1);
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert!(h.media.is_active(TrackKind::Camera));
        assert!(h.flags.borrow().has_video);
    }

    #[tokio::test]
    async fn final_desired_state_wins() {
        let mut h = harness();
        h.backend.hold(TrackKind::Audio);
        h.media.set_enabled(TrackKind::Audio, true, None, &mut h.peers).await;
        h.media.set_enabled(TrackKind::Audio, false, None, &mut h.peers).await;
        h.backend.release(TrackKind::Audio);
        pump_one(&mut h).await;

        assert!(!h.media.is_active(TrackKind::Audio));
        assert!(!h.flags.borrow().has_audio);
    }

    #[tokio::test]
    async fn acquisition_failure_keeps_previous_state() {
        let mut h = harness();
        h.backend.fail(TrackKind::Camera, DeviceError::NotFound(TrackKind::Camera));
        let (tx, rx) = oneshot::channel();
        h.media.set_enabled(TrackKind::Camera, true, Some(tx), &mut h.peers).await;
        pump_one(&mut h).await;

        assert_eq!(rx.await.unwrap(), Err(DeviceError::NotFound(TrackKind::Camera)));
        assert!(!h.media.is_active(TrackKind::Camera));
        assert!(!h.flags.borrow().has_video);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn screen_share_takes_the_video_slot_and_reverts_when_it_ends() {
        let mut h = harness();
        h.peers
            .on_participant_joined(
                Participant::observed("bob".into(), None, Utc::now()),
                NegotiationRole::Responder,
            )
            .await;
        h.media.acquire_initial(TrackKind::Camera).await.unwrap();
        h.media.publish(&mut h.peers).await;
        let camera = h.media.outgoing_tracks().video.unwrap();

        h.media.set_enabled(TrackKind::Screen, true, None, &mut h.peers).await;
        pump_one(&mut h).await;
        let screen = h.media.outgoing_tracks().video.unwrap();
        assert_eq!(screen.kind(), TrackKind::Screen);
        assert!(h.media.screen_sharing());

        h.backend.end(TrackKind::Screen);
        pump_one(&mut h).await;
        assert!(!h.media.screen_sharing());
        assert_eq!(h.media.outgoing_tracks().video, Some(camera.clone()));

        let (_, transport) = h.connector.transport_for(&"bob".into()).unwrap();
        let videos: Vec<_> = transport
            .replaced_tracks()
            .into_iter()
            .map(|t| t.video.map(|v| v.kind()))
            .collect();
        assert_eq!(
            videos,
            vec![Some(TrackKind::Camera), Some(TrackKind::Screen), Some(TrackKind::Camera)]
        );
    }

    #[tokio::test]
    async fn media_changes_are_announced() {
        let mut h = harness();
        h.media.set_enabled(TrackKind::Audio, true, None, &mut h.peers).await;
        pump_one(&mut h).await;
        h.media.set_hand_raised(true).await;

        let mut updates = Vec::new();
        while let Ok(env) = h.outbound.try_recv() {
            if let SignalingEnvelope::MediaUpdate { has_audio, hand_raised, .. } = env {
                updates.push((has_audio, hand_raised));
            }
        }
        assert_eq!(updates, vec![(true, false), (true, true)]);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_requests() {
        let mut h = harness();
        h.backend.hold(TrackKind::Camera);
        let (tx, rx) = oneshot::channel();
        h.media.set_enabled(TrackKind::Camera, true, Some(tx), &mut h.peers).await;
        h.media.shutdown();
        assert_eq!(rx.await.unwrap(), Err(DeviceError::Cancelled));
        assert!(!h.media.is_pending(TrackKind::Camera));
    }
}
