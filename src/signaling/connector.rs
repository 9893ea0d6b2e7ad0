use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::SignalingError;

/// One open wire connection as a pair of text-frame queues. Dropping
/// `outbound` closes the connection; `inbound` yields `None` once the remote
/// side is gone.
pub struct WireConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens wire connections to the relay.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<WireConnection, SignalingError>;
}

/// WebSocket connector (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<WireConnection, SignalingError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        debug!(url = %self.url, "Signaling websocket open");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let (in_tx, in_rx) = mpsc::channel::<String>(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                                warn!("Signaling send failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = ws_rx.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling websocket error: {}", e);
                            break;
                        }
                    },
                }
            }
            debug!("Signaling websocket pump stopped");
        });

        Ok(WireConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
