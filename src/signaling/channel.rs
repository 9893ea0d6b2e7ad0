use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::models::{MediaFlags, MeetingId, ParticipantId};
use crate::signaling::{Connector, ReconnectPolicy, SignalingEnvelope, WireConnection};

/// Connection status reported to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingStatus {
    Connected,
    Reconnecting { attempt: u32 },
    Reconnected,
    /// The reconnect budget ran out; no more envelopes flow.
    GaveUp,
    Closed,
}

/// Who this channel joins as.
#[derive(Debug, Clone)]
pub struct ChannelIdentity {
    pub meeting_id: MeetingId,
    pub participant_id: ParticipantId,
    pub display_name: Option<String>,
}

/// Cloneable outbound half of the channel.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingEnvelope>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::Sender<SignalingEnvelope>) -> Self {
        Self { tx }
    }

    /// Queue an envelope. Envelopes queued while the connection is down are
    /// sent after the next successful reconnect.
    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).await.map_err(|_| SignalingError::Closed)
    }
}

/// Duplex signaling connection to the relay with transparent reconnect.
pub struct SignalingChannel {
    sender: SignalingSender,
    status: watch::Receiver<SignalingStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SignalingChannel {
    /// Open the channel. The first connection attempt is awaited and its
    /// failure returned; after that the channel reconnects on its own.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        identity: ChannelIdentity,
        policy: ReconnectPolicy,
        media_state: watch::Receiver<MediaFlags>,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<SignalingEnvelope>), SignalingError> {
        let first = connector.connect().await?;
        info!(
            meeting = %identity.meeting_id,
            participant = %identity.participant_id,
            "Signaling connected"
        );

        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(SignalingStatus::Connected);

        let worker = ChannelWorker {
            connector,
            identity,
            policy,
            media_state,
            outbound: out_rx,
            inbound: in_tx,
            status: status_tx,
            cancel: cancel.clone(),
            carry: None,
        };
        let task = tokio::spawn(worker.run(first));

        let channel = Self {
            sender: SignalingSender::new(out_tx),
            status: status_rx,
            cancel,
            task,
        };
        Ok((channel, in_rx))
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.sender.send(envelope).await
    }

    pub fn status(&self) -> watch::Receiver<SignalingStatus> {
        self.status.clone()
    }

    /// Close the connection and cancel any pending reconnect wait.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Signaling task ended abnormally: {}", e);
        }
    }
}

enum Served {
    /// Closed on purpose or nobody is listening any more.
    Closed,
    /// The transport went away underneath us.
    Dropped,
}

struct ChannelWorker {
    connector: Arc<dyn Connector>,
    identity: ChannelIdentity,
    policy: ReconnectPolicy,
    media_state: watch::Receiver<MediaFlags>,
    outbound: mpsc::Receiver<SignalingEnvelope>,
    inbound: mpsc::Sender<SignalingEnvelope>,
    status: watch::Sender<SignalingStatus>,
    cancel: CancellationToken,
    /// Envelope whose send hit a dead connection; retried after reconnect.
    carry: Option<SignalingEnvelope>,
}

impl ChannelWorker {
    async fn run(mut self, first: WireConnection) {
        let mut conn = first;
        let mut reannounce = false;
        loop {
            if let Served::Closed = self.serve(conn, reannounce).await {
                break;
            }
            match self.reconnect().await {
                Some(next) => {
                    conn = next;
                    reannounce = true;
                    self.status.send_replace(SignalingStatus::Reconnected);
                }
                None => return,
            }
        }
        self.status.send_replace(SignalingStatus::Closed);
        debug!("Signaling channel closed");
    }

    async fn reconnect(&mut self) -> Option<WireConnection> {
        let mut attempt = 0;
        loop {
            self.status
                .send_replace(SignalingStatus::Reconnecting { attempt: attempt + 1 });
            if !self.policy.wait(attempt, &self.cancel).await {
                if self.cancel.is_cancelled() {
                    self.status.send_replace(SignalingStatus::Closed);
                } else {
                    warn!(attempts = attempt, "Signaling reconnect budget exhausted, giving up");
                    self.status.send_replace(SignalingStatus::GaveUp);
                }
                return None;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.status.send_replace(SignalingStatus::Closed);
                    return None;
                }
                result = self.connector.connect() => result,
            };
            match result {
                Ok(conn) => {
                    info!(attempt = attempt + 1, "Signaling reconnected");
                    return Some(conn);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, "Signaling reconnect failed: {}", e);
                    attempt += 1;
                }
            }
        }
    }

    /// Drive one connection until it drops or the channel is closed.
    async fn serve(&mut self, mut conn: WireConnection, reannounce: bool) -> Served {
        let join = SignalingEnvelope::Join {
            meeting_id: self.identity.meeting_id.clone(),
            participant_id: self.identity.participant_id.clone(),
            display_name: self.identity.display_name.clone(),
        };
        if !write(&conn, &join).await {
            return Served::Dropped;
        }
        if reannounce {
            let flags = *self.media_state.borrow();
            let update = SignalingEnvelope::media_update(
                self.identity.meeting_id.clone(),
                self.identity.participant_id.clone(),
                flags,
            );
            if !write(&conn, &update).await {
                return Served::Dropped;
            }
        }
        if let Some(envelope) = self.carry.take() {
            if !write(&conn, &envelope).await {
                self.carry = Some(envelope);
                return Served::Dropped;
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Served::Closed,
                frame = conn.inbound.recv() => match frame {
                    Some(text) => match SignalingEnvelope::decode(&text) {
                        Ok(envelope) => {
                            debug!(kind = envelope.kind(), "Signaling envelope received");
                            if self.inbound.send(envelope).await.is_err() {
                                return Served::Closed;
                            }
                        }
                        Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                    },
                    None => {
                        warn!("Signaling connection lost");
                        return Served::Dropped;
                    }
                },
                queued = self.outbound.recv() => match queued {
                    Some(envelope) => {
                        if !write(&conn, &envelope).await {
                            self.carry = Some(envelope);
                            return Served::Dropped;
                        }
                    }
                    None => return Served::Closed,
                },
            }
        }
    }
}

/// Returns `false` only when the connection is gone. Envelopes that fail to
/// encode are logged and skipped.
async fn write(conn: &WireConnection, envelope: &SignalingEnvelope) -> bool {
    match envelope.encode() {
        Ok(text) => conn.outbound.send(text).await.is_ok(),
        Err(e) => {
            warn!(kind = envelope.kind(), "Failed to encode envelope: {}", e);
            true
        }
    }
}
