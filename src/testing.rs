//! In-memory stand-ins for the network, the peer transports and the capture
//! devices. Used by the unit and integration tests; also handy for driving a
//! session without any real I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, PeerError, SignalingError};
use crate::media::capture::{CaptureBackend, CaptureSource};
use crate::media::{LocalTrack, OutgoingTracks, TrackKind, TrackSource};
use crate::models::ParticipantId;
use crate::peer::{
    LinkContext, NegotiationRole, PeerConnector, PeerEvent, PeerTransport, TransportState,
};
use crate::presence::MemoryPresenceStore;
use crate::relay::{RelayConnection, RelayState, RELAY_QUEUE};
use crate::signaling::{Connector, SignalingEnvelope, WireConnection};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================
// Signaling
// ============================================================

/// The far end of one [`FakeConnector`] connection.
pub struct FakeRemote {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
}

impl FakeRemote {
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next envelope the client sent, or `None` once it hung up.
    pub async fn recv_envelope(&mut self) -> Option<SignalingEnvelope> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(envelope) = SignalingEnvelope::decode(&text) {
                return Some(envelope);
            }
        }
    }

    pub async fn send_text(&self, text: &str) {
        let _ = self.to_client.send(text.to_string()).await;
    }

    pub async fn send_envelope(&self, envelope: &SignalingEnvelope) {
        if let Ok(text) = envelope.encode() {
            self.send_text(&text).await;
        }
    }

    /// Drop the connection as a network failure would.
    pub fn disconnect(self) {}
}

#[derive(Default)]
struct ConnectorState {
    attempts: usize,
    failures: usize,
}

/// Scripted signaling connector: every successful connect hands its remote
/// end to the test through [`next_remote`](Self::next_remote).
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    remotes_tx: mpsc::UnboundedSender<FakeRemote>,
    remotes_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeRemote>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            remotes_tx,
            remotes_rx: Arc::new(tokio::sync::Mutex::new(remotes_rx)),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        lock(&self.state).failures = n;
    }

    /// Attempts so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).attempts
    }

    pub async fn next_remote(&self) -> FakeRemote {
        let mut remotes = self.remotes_rx.lock().await;
        match remotes.recv().await {
            Some(remote) => remote,
            // The connector itself holds a sender, so the queue never closes.
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<WireConnection, SignalingError> {
        {
            let mut state = lock(&self.state);
            state.attempts += 1;
            if state.failures > 0 {
                state.failures -= 1;
                return Err(SignalingError::Connect {
                    url: "fake://relay".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }

        let (outbound, from_client) = mpsc::channel(256);
        let (to_client, inbound) = mpsc::channel(256);
        let _ = self.remotes_tx.send(FakeRemote { from_client, to_client });
        Ok(WireConnection { outbound, inbound })
    }
}

/// The relay's routing, reached over in-process channels instead of a
/// socket. Shares attendance with the sessions through a
/// [`MemoryPresenceStore`].
#[derive(Clone)]
pub struct LocalRelay {
    state: RelayState,
    connections: Arc<Mutex<Vec<CancellationToken>>>,
    attempts: Arc<AtomicUsize>,
}

impl LocalRelay {
    pub fn new(presence: Arc<MemoryPresenceStore>) -> Self {
        Self {
            state: RelayState::new(presence),
            connections: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Cut every open connection.
    pub fn drop_connections(&self) {
        for token in lock(&self.connections).drain(..) {
            token.cancel();
        }
    }
}

#[async_trait]
impl Connector for LocalRelay {
    async fn connect(&self) -> Result<WireConnection, SignalingError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (outbound, mut from_client) = mpsc::channel::<String>(RELAY_QUEUE);
        let (to_client, inbound) = mpsc::channel(RELAY_QUEUE);
        let kill = CancellationToken::new();
        lock(&self.connections).push(kill.clone());

        let state = self.state.clone();
        tokio::spawn(async move {
            let mut conn = RelayConnection::new(to_client);
            loop {
                tokio::select! {
                    _ = kill.cancelled() => break,
                    frame = from_client.recv() => match frame {
                        Some(text) => state.on_frame(&mut conn, &text).await,
                        None => break,
                    },
                }
            }
            state.on_disconnect(conn).await;
        });

        Ok(WireConnection { outbound, inbound })
    }
}

// ============================================================
// Peer transports
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    CreateOffer,
    CreateAnswer,
    SetRemote,
    AddCandidate,
    ReplaceTracks,
    Close,
}

/// Transport that accepts every negotiation step and records it.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<TransportCall>>,
    candidates: Mutex<Vec<Value>>,
    replaced: Mutex<Vec<OutgoingTracks>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    /// Remote candidates applied, in order.
    pub fn candidates(&self) -> Vec<Value> {
        lock(&self.candidates).clone()
    }

    /// Every track set pushed through `replace_tracks`, in order.
    pub fn replaced_tracks(&self) -> Vec<OutgoingTracks> {
        lock(&self.replaced).clone()
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        self.record(TransportCall::CreateOffer);
        Ok(json!({"type": "offer", "sdp": "v=0 fake-offer"}))
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        self.record(TransportCall::CreateAnswer);
        Ok(json!({"type": "answer", "sdp": "v=0 fake-answer"}))
    }

    async fn set_remote_description(&self, _sdp: Value) -> Result<(), PeerError> {
        self.record(TransportCall::SetRemote);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        self.record(TransportCall::AddCandidate);
        lock(&self.candidates).push(candidate);
        Ok(())
    }

    async fn replace_tracks(&self, tracks: &OutgoingTracks) -> Result<(), PeerError> {
        self.record(TransportCall::ReplaceTracks);
        lock(&self.replaced).push(tracks.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(TransportCall::Close);
        Ok(())
    }
}

struct FakeLink {
    generation: u64,
    role: NegotiationRole,
    transport: Arc<FakeTransport>,
    events: mpsc::Sender<PeerEvent>,
}

#[derive(Default)]
struct PeerConnectorState {
    connects: usize,
    links: HashMap<ParticipantId, FakeLink>,
    history: HashMap<ParticipantId, Vec<(u64, Arc<FakeTransport>)>>,
}

/// Hands out [`FakeTransport`]s and keeps the latest one per participant so
/// tests can inspect it or inject transport events.
#[derive(Clone, Default)]
pub struct FakePeerConnector {
    state: Arc<Mutex<PeerConnectorState>>,
}

impl FakePeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    /// Generation and transport of the newest link to `id`.
    pub fn transport_for(&self, id: &ParticipantId) -> Option<(u64, Arc<FakeTransport>)> {
        lock(&self.state)
            .links
            .get(id)
            .map(|link| (link.generation, link.transport.clone()))
    }

    /// Every transport built for `id`, oldest first.
    pub fn transports_for(&self, id: &ParticipantId) -> Vec<(u64, Arc<FakeTransport>)> {
        lock(&self.state).history.get(id).cloned().unwrap_or_default()
    }

    /// Role the newest link to `id` was built with.
    pub fn role_of(&self, id: &ParticipantId) -> Option<NegotiationRole> {
        lock(&self.state).links.get(id).map(|link| link.role)
    }

    /// Report a connection state change on the newest link to `id`, as the
    /// transport's own callback would.
    pub async fn report_state(&self, id: &ParticipantId, state: TransportState) -> bool {
        self.post(id, |participant_id, generation| PeerEvent::StateChanged {
            participant_id,
            generation,
            state,
        })
        .await
    }

    /// Surface a gathered local ICE candidate on the newest link to `id`.
    pub async fn report_candidate(&self, id: &ParticipantId, candidate: Value) -> bool {
        self.post(id, |participant_id, generation| PeerEvent::LocalCandidate {
            participant_id,
            generation,
            candidate,
        })
        .await
    }

    async fn post(&self, id: &ParticipantId, event: impl FnOnce(ParticipantId, u64) -> PeerEvent) -> bool {
        let target = lock(&self.state)
            .links
            .get(id)
            .map(|link| (link.generation, link.events.clone()));
        let Some((generation, events)) = target else {
            return false;
        };
        events.send(event(id.clone(), generation)).await.is_ok()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(&self, ctx: LinkContext) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = Arc::new(FakeTransport::default());
        let mut state = lock(&self.state);
        state.connects += 1;
        state
            .history
            .entry(ctx.participant_id.clone())
            .or_default()
            .push((ctx.generation, transport.clone()));
        state.links.insert(
            ctx.participant_id,
            FakeLink {
                generation: ctx.generation,
                role: ctx.role,
                transport: transport.clone(),
                events: ctx.events,
            },
        );
        Ok(transport)
    }
}

// ============================================================
// Capture devices
// ============================================================

#[derive(Default)]
struct CaptureState {
    gates: HashMap<TrackKind, watch::Sender<bool>>,
    failures: HashMap<TrackKind, DeviceError>,
    enders: HashMap<TrackKind, oneshot::Sender<()>>,
    acquisitions: HashMap<TrackKind, usize>,
    stops: HashMap<TrackKind, usize>,
}

/// Capture backend with silent tracks. Acquisitions can be held open, made
/// to fail, or ended from the "device" side.
#[derive(Clone, Default)]
pub struct FakeCaptureBackend {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block acquisitions of `kind` until [`release`](Self::release).
    pub fn hold(&self, kind: TrackKind) {
        let (tx, _rx) = watch::channel(false);
        lock(&self.state).gates.insert(kind, tx);
    }

    pub fn release(&self, kind: TrackKind) {
        if let Some(gate) = lock(&self.state).gates.get(&kind) {
            gate.send_replace(true);
        }
    }

    /// Fail the next acquisition of `kind` with `error`.
    pub fn fail(&self, kind: TrackKind, error: DeviceError) {
        lock(&self.state).failures.insert(kind, error);
    }

    /// End the most recently acquired `kind` source, like the OS stopping
    /// a screen share.
    pub fn end(&self, kind: TrackKind) {
        if let Some(ender) = lock(&self.state).enders.remove(&kind) {
            let _ = ender.send(());
        }
    }

    /// Acquisitions started for `kind`, failed ones included.
    pub fn acquisitions(&self, kind: TrackKind) -> usize {
        lock(&self.state).acquisitions.get(&kind).copied().unwrap_or(0)
    }

    /// Sources of `kind` that have been released.
    pub fn stops(&self, kind: TrackKind) -> usize {
        lock(&self.state).stops.get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CaptureBackend for FakeCaptureBackend {
    async fn acquire(&self, kind: TrackKind) -> Result<CaptureSource, DeviceError> {
        let gate = {
            let mut state = lock(&self.state);
            *state.acquisitions.entry(kind).or_default() += 1;
            state.gates.get(&kind).map(watch::Sender::subscribe)
        };
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.failures.remove(&kind) {
            return Err(error);
        }
        let (ender, ended) = oneshot::channel();
        state.enders.insert(kind, ender);

        let stopper = self.state.clone();
        Ok(CaptureSource::new(LocalTrack::new(kind, TrackSource::Silent))
            .with_end_signal(ended)
            .with_stopper(move || {
                *lock(&stopper).stops.entry(kind).or_default() += 1;
            }))
    }
}
