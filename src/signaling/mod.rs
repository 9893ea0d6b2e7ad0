//! Client side of the relay signaling protocol.

mod backoff;
mod channel;
mod connector;
mod protocol;

pub use backoff::ReconnectPolicy;
pub use channel::{ChannelIdentity, SignalingChannel, SignalingSender, SignalingStatus};
pub use connector::{Connector, WireConnection, WsConnector};
pub use protocol::SignalingEnvelope;
