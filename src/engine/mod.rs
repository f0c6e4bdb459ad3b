//! Peer-to-peer negotiation engines.
//!
//! The connection manager only drives the handshake; the actual offer/answer
//! production and the reliable data channel live behind [`NegotiationEngine`].
//! Engines report asynchronous happenings (channel open, inbound data,
//! failures, remote close) through the [`EngineEvent`] sender they were built
//! with.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connection::Role;
use crate::error::Result;

pub mod loopback;
pub mod rtc;

pub use loopback::{LoopbackEngine, LoopbackNetwork};
pub use rtc::{WebRtcEngine, WebRtcEngineFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The reliable channel is open and usable.
    Connected,
    Data(Vec<u8>),
    /// Permanent failure (ICE, media, channel).
    Error(String),
    /// The remote side or the transport closed the session.
    Closed,
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// One side of a peer-to-peer session.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Produces the initiator's offer payload.
    async fn create_offer(&self) -> Result<serde_json::Value>;

    /// Consumes a remote offer and produces the responder's answer payload.
    async fn create_answer(&self, offer: serde_json::Value) -> Result<serde_json::Value>;

    /// Feeds an answer or candidate received from the remote side.
    async fn apply_remote_signal(&self, signal: serde_json::Value) -> Result<()>;

    /// Sends over the reliable channel.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Releases the underlying resources. Calling it twice is harmless.
    async fn close(&self);
}

/// Builds one engine per connection.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>>;
}
