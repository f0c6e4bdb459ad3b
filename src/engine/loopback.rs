//! In-process engine that simulates the handshake and the data channel.
//!
//! Engines created from the same [`LoopbackNetwork`] can reach each other by
//! id. The initiator's offer registers it on the network, the responder's
//! answer registers the responder, and applying the answer links the two and
//! reports `Connected` on both sides.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{EngineEvent, EngineEventSender, EngineFactory, NegotiationEngine};
use crate::connection::Role;
use crate::error::{Error, Result};

#[derive(Default)]
pub struct LoopbackNetwork {
    // (local id, peer id) -> that endpoint's event sender and link slot
    endpoints: Mutex<HashMap<(String, String), Endpoint>>,
    partitioned: AtomicBool,
}

#[derive(Clone)]
struct Endpoint {
    events: EngineEventSender,
    link: Arc<Mutex<Option<EngineEventSender>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While partitioned, applying an answer fails the way an ICE failure
    /// would.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Reports `reason` as an engine error to the endpoint `local_id` holds
    /// for `peer_id`, the way a dropped ICE path surfaces mid-session.
    /// Returns false when no such endpoint is registered.
    pub fn drop_link(&self, local_id: &str, peer_id: &str, reason: &str) -> bool {
        match self.lookup(local_id, peer_id) {
            Some(endpoint) => endpoint.events.send(EngineEvent::Error(reason.to_string())).is_ok(),
            None => false,
        }
    }

    fn register(&self, local_id: &str, peer_id: &str, endpoint: Endpoint) {
        self.endpoints
            .lock()
            .insert((local_id.to_string(), peer_id.to_string()), endpoint);
    }

    fn lookup(&self, local_id: &str, peer_id: &str) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .get(&(local_id.to_string(), peer_id.to_string()))
            .cloned()
    }

    fn unregister(&self, local_id: &str, peer_id: &str) {
        self.endpoints
            .lock()
            .remove(&(local_id.to_string(), peer_id.to_string()));
    }
}

#[async_trait]
impl EngineFactory for Arc<LoopbackNetwork> {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>> {
        Ok(Arc::new(LoopbackEngine {
            network: Arc::clone(self),
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            role,
            endpoint: Endpoint {
                events,
                link: Arc::new(Mutex::new(None)),
            },
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct LoopbackEngine {
    network: Arc<LoopbackNetwork>,
    local_id: String,
    peer_id: String,
    role: Role,
    endpoint: Endpoint,
    closed: AtomicBool,
}

impl LoopbackEngine {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("engine closed".into()));
        }
        Ok(())
    }

    fn fail(&self, reason: &str) -> Error {
        let _ = self.endpoint.events.send(EngineEvent::Error(reason.to_string()));
        Error::Negotiation(reason.to_string())
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<serde_json::Value> {
        self.ensure_open()?;
        if self.role != Role::Initiator {
            return Err(Error::InvalidState("responder cannot create an offer".into()));
        }
        self.network
            .register(&self.local_id, &self.peer_id, self.endpoint.clone());
        Ok(json!({ "loopback": "offer", "from": self.local_id, "to": self.peer_id }))
    }

    async fn create_answer(&self, offer: serde_json::Value) -> Result<serde_json::Value> {
        self.ensure_open()?;
        if offer["loopback"] != "offer" || offer["from"] != self.peer_id.as_str() {
            return Err(self.fail("offer does not come from the expected peer"));
        }
        self.network
            .register(&self.local_id, &self.peer_id, self.endpoint.clone());
        Ok(json!({ "loopback": "answer", "from": self.local_id, "to": self.peer_id }))
    }

    async fn apply_remote_signal(&self, signal: serde_json::Value) -> Result<()> {
        self.ensure_open()?;
        match signal["loopback"].as_str() {
            Some("answer") => {
                if self.network.partitioned.load(Ordering::SeqCst) {
                    return Err(self.fail("ice connection failed"));
                }
                let Some(remote) = self.network.lookup(&self.peer_id, &self.local_id) else {
                    return Err(self.fail("answering peer is not reachable"));
                };
                *self.endpoint.link.lock() = Some(remote.events.clone());
                *remote.link.lock() = Some(self.endpoint.events.clone());
                let _ = self.endpoint.events.send(EngineEvent::Connected);
                let _ = remote.events.send(EngineEvent::Connected);
                Ok(())
            }
            // Non-trickle: candidates are already folded into the offer/answer.
            Some("candidate") => Ok(()),
            _ => Err(Error::Negotiation(format!("unexpected signal: {}", signal))),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let link = self.endpoint.link.lock().clone();
        match link {
            Some(remote) => remote
                .send(EngineEvent::Data(data.to_vec()))
                .map_err(|_| Error::Negotiation("remote channel closed".into())),
            None => Err(Error::Negotiation("channel not open".into())),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(&self.local_id, &self.peer_id);
        if let Some(remote) = self.endpoint.link.lock().take() {
            let _ = remote.send(EngineEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn pair(
        network: &Arc<LoopbackNetwork>,
    ) -> (
        Arc<dyn NegotiationEngine>,
        mpsc::UnboundedReceiver<EngineEvent>,
        Arc<dyn NegotiationEngine>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = network.create("a", "b", Role::Initiator, a_tx).await.unwrap();
        let b = network.create("b", "a", Role::Responder, b_tx).await.unwrap();
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn handshake_links_both_sides() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, mut b_rx) = pair(&network).await;

        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(offer).await.unwrap();
        a.apply_remote_signal(answer).await.unwrap();

        assert_eq!(a_rx.recv().await, Some(EngineEvent::Connected));
        assert_eq!(b_rx.recv().await, Some(EngineEvent::Connected));

        a.send(b"hello").await.unwrap();
        assert_eq!(b_rx.recv().await, Some(EngineEvent::Data(b"hello".to_vec())));

        a.close().await;
        assert_eq!(b_rx.recv().await, Some(EngineEvent::Closed));
        assert!(a.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn partition_reports_error() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, _b_rx) = pair(&network).await;
        network.set_partitioned(true);

        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(offer).await.unwrap();
        assert!(a.apply_remote_signal(answer).await.is_err());
        assert!(matches!(a_rx.recv().await, Some(EngineEvent::Error(_))));
    }

    #[tokio::test]
    async fn dropped_link_reports_error_to_one_side() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, mut b_rx) = pair(&network).await;
        assert!(!network.drop_link("a", "b", "too early"));

        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(offer).await.unwrap();
        a.apply_remote_signal(answer).await.unwrap();
        assert_eq!(a_rx.recv().await, Some(EngineEvent::Connected));
        assert_eq!(b_rx.recv().await, Some(EngineEvent::Connected));

        assert!(network.drop_link("a", "b", "ice path lost"));
        assert_eq!(a_rx.recv().await, Some(EngineEvent::Error("ice path lost".into())));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx, _b, _b_rx) = pair(&network).await;
        assert!(a.send(b"too early").await.is_err());
    }
}
