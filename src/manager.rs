//! Per-peer connection state machines.
//!
//! The manager owns one [`ConnectionSlot`] per remote peer. An initiator slot
//! sends its offer through the [`SignalRelay`], then polls its own mailbox
//! every `poll_interval` until the answer shows up, and gives up once
//! `handshake_timeout` has passed. A responder slot answers an offer it was
//! handed and then waits for the engine to report the channel open. Every
//! state change goes through [`ConnectionSlot::transition`], so whichever of
//! "connected" and "timed out" happens first wins and the other is a no-op.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{ChatEntry, ChatFrame, Connection, ConnectionState, Direction, Role};
use crate::engine::{EngineEvent, EngineEventReceiver, EngineFactory, NegotiationEngine};
use crate::error::{Error, Result};
use crate::protocol::{SignalKind, SignalMessage, SignalRequest};
use crate::relay::SignalRelay;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    /// Bound on a single mailbox append or drain.
    pub signal_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            signal_timeout: DEFAULT_SIGNAL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Connected { peer_id: String },
    Message { peer_id: String, entry: ChatEntry },
    /// Fired exactly once per connection, whichever side closed it.
    Disconnected { peer_id: String },
    Failed { peer_id: String, reason: String },
    /// An offer from a peer we have no live connection with.
    IncomingOffer { from: String, payload: serde_json::Value },
}

struct ConnectionSlot {
    id: String,
    peer_id: String,
    peer_display_name: String,
    role: Role,
    engine: Arc<dyn NegotiationEngine>,
    state: watch::Sender<ConnectionState>,
    messages: Mutex<Vec<ChatEntry>>,
    answer_applied: AtomicBool,
    disconnect_fired: AtomicBool,
    handshake: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSlot {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Atomically moves to `next` if the state machine allows it.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn snapshot(&self) -> Connection {
        Connection {
            id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            peer_display_name: self.peer_display_name.clone(),
            role: self.role,
            state: self.state(),
            messages: self.messages.lock().clone(),
        }
    }

    fn stop_handshake(&self) {
        if let Some(handle) = self.handshake.lock().take() {
            handle.abort();
        }
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

struct Inner {
    local_id: String,
    relay: Arc<dyn SignalRelay>,
    engines: Arc<dyn EngineFactory>,
    config: ManagerConfig,
    connections: Mutex<HashMap<String, Arc<ConnectionSlot>>>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        local_id: impl Into<String>,
        relay: Arc<dyn SignalRelay>,
        engines: Arc<dyn EngineFactory>,
        config: ManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                local_id: local_id.into(),
                relay,
                engines,
                config,
                connections: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (manager, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Starts a connection to `peer_id` as the initiator: produces the offer,
    /// parks it in the peer's mailbox and starts polling for the answer.
    pub async fn initiate_connection(&self, peer_id: &str, display_name: &str) -> Result<Connection> {
        tracing::info!("Initiating connection to {} ({})", display_name, peer_id);
        let deadline = Instant::now() + self.inner.config.handshake_timeout;
        let slot = self.open_slot(peer_id, display_name, Role::Initiator).await?;

        let sent = tokio::time::timeout_at(deadline, async {
            let offer = slot.engine.create_offer().await?;
            self.inner.send_signal(peer_id, SignalKind::Offer, offer).await
        })
        .await;
        self.finish_signal(&slot, sent, "offer")?;

        let handle = tokio::spawn(Inner::drive_handshake(
            Arc::clone(&self.inner),
            Arc::clone(&slot),
            deadline,
            true,
        ));
        *slot.handshake.lock() = Some(handle);
        Ok(slot.snapshot())
    }

    /// Answers an offer that reached us out of band. The responder does not
    /// poll afterwards; the initiator picks the answer up from its mailbox.
    pub async fn accept_connection(
        &self,
        peer_id: &str,
        display_name: &str,
        offer: serde_json::Value,
    ) -> Result<Connection> {
        tracing::info!("Accepting connection from {} ({})", display_name, peer_id);
        let deadline = Instant::now() + self.inner.config.handshake_timeout;
        let slot = self.open_slot(peer_id, display_name, Role::Responder).await?;

        let sent = tokio::time::timeout_at(deadline, async {
            let answer = slot.engine.create_answer(offer).await?;
            self.inner.send_signal(peer_id, SignalKind::Answer, answer).await
        })
        .await;
        self.finish_signal(&slot, sent, "answer")?;

        let handle = tokio::spawn(Inner::drive_handshake(
            Arc::clone(&self.inner),
            Arc::clone(&slot),
            deadline,
            false,
        ));
        *slot.handshake.lock() = Some(handle);
        Ok(slot.snapshot())
    }

    fn finish_signal(
        &self,
        slot: &ConnectionSlot,
        sent: std::result::Result<Result<String>, tokio::time::error::Elapsed>,
        what: &str,
    ) -> Result<()> {
        match sent {
            Ok(Ok(message_id)) => {
                tracing::debug!("Sent {} {} to {}", what, message_id, slot.peer_id);
                Ok(())
            }
            Ok(Err(err)) => {
                self.inner.fail(slot, format!("failed to send {}: {}", what, err));
                Err(err)
            }
            Err(_) => {
                let timeout = self.inner.config.handshake_timeout;
                self.inner.fail(slot, format!("timed out producing {}", what));
                Err(Error::Timeout(timeout))
            }
        }
    }

    async fn open_slot(&self, peer_id: &str, display_name: &str, role: Role) -> Result<Arc<ConnectionSlot>> {
        let existing = self.inner.connections.lock().get(peer_id).cloned();
        if let Some(existing) = existing {
            if !existing.state().is_terminal() {
                return Err(Error::InvalidState(format!(
                    "connection to {} already {:?}",
                    peer_id,
                    existing.state()
                )));
            }
            // A failed connection is replaced by the new attempt.
            self.close_connection(peer_id).await;
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = self
            .inner
            .engines
            .create(&self.inner.local_id, peer_id, role, engine_tx)
            .await?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let slot = Arc::new(ConnectionSlot {
            id: Connection::connection_id(&self.inner.local_id, peer_id, role),
            peer_id: peer_id.to_string(),
            peer_display_name: display_name.to_string(),
            role,
            engine,
            state,
            messages: Mutex::new(Vec::new()),
            answer_applied: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
            handshake: Mutex::new(None),
            pump: Mutex::new(None),
        });

        let raced = {
            let mut table = self.inner.connections.lock();
            match table.get(peer_id) {
                Some(other) if !other.state().is_terminal() => true,
                _ => {
                    table.insert(peer_id.to_string(), Arc::clone(&slot));
                    false
                }
            }
        };
        if raced {
            slot.engine.close().await;
            return Err(Error::InvalidState(format!(
                "connection to {} opened concurrently",
                peer_id
            )));
        }

        let pump = tokio::spawn(Inner::pump_engine_events(
            Arc::clone(&self.inner),
            Arc::clone(&slot),
            engine_rx,
        ));
        *slot.pump.lock() = Some(pump);
        Ok(slot)
    }

    /// Sends `text` over the connection's reliable channel. Returns false
    /// without touching the history unless the connection is `connected`.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> bool {
        let slot = self.inner.connections.lock().get(peer_id).cloned();
        let Some(slot) = slot else {
            tracing::warn!("Cannot send message to {}: no connection", peer_id);
            return false;
        };
        if slot.state() != ConnectionState::Connected {
            tracing::warn!("Cannot send message to {}: connection is {:?}", peer_id, slot.state());
            return false;
        }

        let frame = ChatFrame::new(text);
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Failed to encode message for {}: {}", peer_id, err);
                return false;
            }
        };
        if let Err(err) = slot.engine.send(&bytes).await {
            tracing::warn!("Failed to send message to {}: {}", peer_id, err);
            return false;
        }

        slot.messages.lock().push(frame.into_entry(Direction::Own));
        tracing::debug!("Sent message to {}", peer_id);
        true
    }

    /// Releases the connection's engine, forgets it and fires the disconnect
    /// event. Closing an unknown or already closed peer does nothing.
    pub async fn close_connection(&self, peer_id: &str) {
        let slot = self.inner.connections.lock().remove(peer_id);
        let Some(slot) = slot else {
            tracing::debug!("Close requested for unknown connection {}", peer_id);
            return;
        };

        slot.transition(ConnectionState::Disconnected);
        slot.stop_handshake();
        slot.stop_pump();
        slot.engine.close().await;
        self.inner.fire_disconnect(&slot);
        tracing::info!("Closed connection to {}", peer_id);
    }

    pub async fn close_all_connections(&self) {
        let peers: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        for peer_id in peers {
            self.close_connection(&peer_id).await;
        }
    }

    /// Drains our mailbox once and routes what was waiting. Responders use
    /// this to notice offers; initiators already do it on every poll tick.
    pub async fn poll_incoming(&self) {
        self.inner.poll_mailbox().await;
    }

    pub fn connection(&self, peer_id: &str) -> Option<Connection> {
        self.inner
            .connections
            .lock()
            .get(peer_id)
            .map(|slot| slot.snapshot())
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    pub fn active_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|slot| slot.state() == ConnectionState::Connected)
            .count()
    }

    /// Watches the state of the current connection to `peer_id`.
    pub fn watch_state(&self, peer_id: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.inner
            .connections
            .lock()
            .get(peer_id)
            .map(|slot| slot.state.subscribe())
    }
}

impl Inner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, slot: &ConnectionSlot, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !slot.transition(ConnectionState::Error) {
            return false;
        }
        tracing::warn!("Connection to {} failed: {}", slot.peer_id, reason);
        self.emit(ManagerEvent::Failed {
            peer_id: slot.peer_id.clone(),
            reason,
        });
        true
    }

    fn fire_disconnect(&self, slot: &ConnectionSlot) {
        if slot.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(ManagerEvent::Disconnected {
            peer_id: slot.peer_id.clone(),
        });
    }

    async fn send_signal(&self, to: &str, kind: SignalKind, payload: serde_json::Value) -> Result<String> {
        let request = SignalRequest::new(&self.local_id, to, kind, payload);
        tokio::time::timeout(self.config.signal_timeout, self.relay.send_signal(request))
            .await
            .map_err(|_| Error::Timeout(self.config.signal_timeout))?
    }

    async fn poll_mailbox(&self) {
        let drained = tokio::time::timeout(
            self.config.signal_timeout,
            self.relay.drain_signals(&self.local_id),
        )
        .await;
        match drained {
            Ok(Ok(messages)) => {
                for message in messages {
                    self.route_signal(message).await;
                }
            }
            Ok(Err(err)) => tracing::debug!("Mailbox poll failed, will retry: {}", err),
            Err(_) => tracing::debug!("Mailbox poll timed out, will retry"),
        }
    }

    async fn route_signal(&self, message: SignalMessage) {
        if message.to != self.local_id {
            tracing::debug!("Dropping signal addressed to {}", message.to);
            return;
        }
        let slot = self.connections.lock().get(&message.from).cloned();

        match (message.kind, slot) {
            (SignalKind::Answer, Some(slot))
                if slot.role == Role::Initiator && slot.state() == ConnectionState::Connecting =>
            {
                if slot.answer_applied.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Ignoring duplicate answer from {}", slot.peer_id);
                    return;
                }
                tracing::info!("Received answer from {}", slot.peer_id);
                if let Err(err) = slot.engine.apply_remote_signal(message.payload).await {
                    self.fail(&slot, format!("failed to apply answer: {}", err));
                }
            }
            (SignalKind::Candidate, Some(slot)) if !slot.state().is_terminal() => {
                if let Err(err) = slot.engine.apply_remote_signal(message.payload).await {
                    tracing::debug!("Ignoring bad candidate from {}: {}", slot.peer_id, err);
                }
            }
            (SignalKind::Offer, slot)
                if slot.as_ref().map_or(true, |slot| slot.state().is_terminal()) =>
            {
                tracing::info!("Received offer from {}", message.from);
                self.emit(ManagerEvent::IncomingOffer {
                    from: message.from,
                    payload: message.payload,
                });
            }
            (kind, _) => {
                tracing::debug!("Dropping unroutable {} from {}", kind, message.from);
            }
        }
    }

    async fn drive_handshake(
        inner: Arc<Inner>,
        slot: Arc<ConnectionSlot>,
        deadline: Instant,
        mut polling: bool,
    ) {
        let poll_interval = inner.config.poll_interval;
        let mut state_rx = slot.state.subscribe();
        let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            if *state_rx.borrow_and_update() != ConnectionState::Connecting {
                break;
            }
            tokio::select! {
                _ = &mut expiry => {
                    inner.fail(&slot, "handshake timed out");
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick(), if polling => {
                    inner.poll_mailbox().await;
                    if slot.answer_applied.load(Ordering::SeqCst) {
                        polling = false;
                    }
                }
            }
        }
        tracing::debug!("Handshake loop for {} finished in {:?}", slot.peer_id, slot.state());
    }

    async fn pump_engine_events(inner: Arc<Inner>, slot: Arc<ConnectionSlot>, mut events: EngineEventReceiver) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Connected => {
                    if slot.transition(ConnectionState::Connected) {
                        tracing::info!("Connected to {}", slot.peer_id);
                        inner.emit(ManagerEvent::Connected {
                            peer_id: slot.peer_id.clone(),
                        });
                    }
                }
                EngineEvent::Data(bytes) => inner.receive_data(&slot, &bytes),
                EngineEvent::Error(reason) => {
                    inner.fail(&slot, reason);
                }
                EngineEvent::Closed => {
                    inner.remote_closed(&slot).await;
                    break;
                }
            }
        }
    }

    fn receive_data(&self, slot: &ConnectionSlot, bytes: &[u8]) {
        if slot.state() != ConnectionState::Connected {
            tracing::debug!("Dropping data from {} outside connected state", slot.peer_id);
            return;
        }
        let frame: ChatFrame = match serde_json::from_slice(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("Dropping undecodable message from {}: {}", slot.peer_id, err);
                return;
            }
        };
        let entry = frame.into_entry(Direction::Remote);
        slot.messages.lock().push(entry.clone());
        self.emit(ManagerEvent::Message {
            peer_id: slot.peer_id.clone(),
            entry,
        });
    }

    async fn remote_closed(&self, slot: &Arc<ConnectionSlot>) {
        {
            let mut table = self.connections.lock();
            if table
                .get(&slot.peer_id)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                table.remove(&slot.peer_id);
            }
        }
        slot.transition(ConnectionState::Disconnected);
        slot.stop_handshake();
        slot.engine.close().await;
        tracing::info!("Connection to {} closed by remote", slot.peer_id);
        self.fire_disconnect(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackNetwork;
    use crate::mailbox::SignalMailbox;

    struct Side {
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
    }

    fn side(id: &str, mailbox: &Arc<SignalMailbox>, network: &Arc<LoopbackNetwork>) -> Side {
        let (manager, events) = ConnectionManager::new(
            id,
            Arc::new(Arc::clone(mailbox)),
            Arc::new(Arc::clone(network)),
            ManagerConfig::default(),
        );
        Side { manager, events }
    }

    async fn next_event(side: &mut Side) -> ManagerEvent {
        tokio::time::timeout(Duration::from_secs(60), side.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Runs the scenario up to both sides reporting `Connected`.
    async fn connected_pair(network: &Arc<LoopbackNetwork>) -> (Side, Side, Arc<SignalMailbox>) {
        let mailbox = Arc::new(SignalMailbox::default());
        let mut alice = side("alice", &mailbox, network);
        let mut bob = side("bob", &mailbox, network);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        let offer = mailbox.drain_all("bob").pop().unwrap();
        bob.manager
            .accept_connection("alice", "Alice", offer.payload)
            .await
            .unwrap();

        assert_eq!(next_event(&mut alice).await, ManagerEvent::Connected { peer_id: "bob".into() });
        assert_eq!(next_event(&mut bob).await, ManagerEvent::Connected { peer_id: "alice".into() });
        (alice, bob, mailbox)
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_connects_within_two_poll_intervals() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut alice = side("alice", &mailbox, &network);
        let bob = side("bob", &mailbox, &network);

        let started = alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        assert_eq!(started.state, ConnectionState::Connecting);
        assert_eq!(started.role, Role::Initiator);
        assert_eq!(started.id, "alice-bob");

        let offers = mailbox.drain_all("bob");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].kind, SignalKind::Offer);
        assert_eq!(offers[0].from, "alice");

        let answered_at = Instant::now();
        bob.manager
            .accept_connection("alice", "Alice", offers[0].payload.clone())
            .await
            .unwrap();
        assert_eq!(mailbox.pending("alice"), 1);

        assert_eq!(next_event(&mut alice).await, ManagerEvent::Connected { peer_id: "bob".into() });
        assert!(answered_at.elapsed() <= 2 * DEFAULT_POLL_INTERVAL);
        assert_eq!(alice.manager.connection("bob").unwrap().state, ConnectionState::Connected);
        assert_eq!(bob.manager.connection("alice").unwrap().id, "alice-bob");
        assert_eq!(alice.manager.active_connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_times_out_into_error() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut alice = side("alice", &mailbox, &network);

        let started_at = Instant::now();
        alice.manager.initiate_connection("ghost", "Ghost").await.unwrap();

        match next_event(&mut alice).await {
            ManagerEvent::Failed { peer_id, reason } => {
                assert_eq!(peer_id, "ghost");
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(started_at.elapsed() >= DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(alice.manager.connection("ghost").unwrap().state, ConnectionState::Error);

        // A late answer must not revive it.
        let mut state = alice.manager.watch_state("ghost").unwrap();
        mailbox.append(
            "alice",
            SignalMessage::new("ghost", "alice", SignalKind::Answer, serde_json::json!({"loopback": "answer"})),
        );
        alice.manager.poll_incoming().await;
        assert_eq!(*state.borrow_and_update(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connected_state() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let alice = side("alice", &mailbox, &network);

        assert!(!alice.manager.send_message("bob", "nobody there").await);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        assert!(!alice.manager.send_message("bob", "too early").await);
        assert!(alice.manager.connection("bob").unwrap().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_flow_both_ways() {
        let (mut alice, mut bob, _mailbox) = connected_pair(&LoopbackNetwork::new()).await;

        assert!(alice.manager.send_message("bob", "hello bob").await);
        match next_event(&mut bob).await {
            ManagerEvent::Message { peer_id, entry } => {
                assert_eq!(peer_id, "alice");
                assert_eq!(entry.text, "hello bob");
                assert_eq!(entry.direction, Direction::Remote);
            }
            other => panic!("expected message, got {other:?}"),
        }

        assert!(bob.manager.send_message("alice", "hi alice").await);
        assert!(matches!(next_event(&mut alice).await, ManagerEvent::Message { .. }));

        let history = alice.manager.connection("bob").unwrap().messages;
        let directions: Vec<_> = history.iter().map(|e| e.direction).collect();
        assert_eq!(directions, vec![Direction::Own, Direction::Remote]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fires_disconnect_once_on_each_side() {
        let (mut alice, mut bob, _mailbox) = connected_pair(&LoopbackNetwork::new()).await;

        alice.manager.close_connection("bob").await;
        alice.manager.close_connection("bob").await;
        assert_eq!(next_event(&mut alice).await, ManagerEvent::Disconnected { peer_id: "bob".into() });
        assert!(alice.manager.connection("bob").is_none());

        assert_eq!(next_event(&mut bob).await, ManagerEvent::Disconnected { peer_id: "alice".into() });
        assert!(bob.manager.connection("alice").is_none());

        bob.manager.close_connection("alice").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(alice.events.try_recv().is_err());
        assert!(bob.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failure_is_terminal() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut alice = side("alice", &mailbox, &network);
        let bob = side("bob", &mailbox, &network);
        network.set_partitioned(true);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        let offer = mailbox.drain_all("bob").pop().unwrap();
        bob.manager
            .accept_connection("alice", "Alice", offer.payload)
            .await
            .unwrap();

        assert!(matches!(next_event(&mut alice).await, ManagerEvent::Failed { .. }));
        tokio::time::sleep(DEFAULT_HANDSHAKE_TIMEOUT).await;
        assert_eq!(alice.manager.connection("bob").unwrap().state, ConnectionState::Error);
        assert!(alice.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connection_can_be_replaced() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut alice = side("alice", &mailbox, &network);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        assert!(alice.manager.initiate_connection("bob", "Bob").await.is_err());

        assert!(matches!(next_event(&mut alice).await, ManagerEvent::Failed { .. }));
        let retry = alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        assert_eq!(retry.state, ConnectionState::Connecting);
        assert_eq!(next_event(&mut alice).await, ManagerEvent::Disconnected { peer_id: "bob".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn offers_without_a_connection_are_surfaced() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let alice = side("alice", &mailbox, &network);
        let mut bob = side("bob", &mailbox, &network);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        bob.manager.poll_incoming().await;

        match next_event(&mut bob).await {
            ManagerEvent::IncomingOffer { from, payload } => {
                assert_eq!(from, "alice");
                bob.manager.accept_connection(&from, "Alice", payload).await.unwrap();
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert_eq!(next_event(&mut bob).await, ManagerEvent::Connected { peer_id: "alice".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn responder_gives_up_when_initiator_never_links() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut bob = side("bob", &mailbox, &network);

        let started_at = Instant::now();
        let offer = serde_json::json!({ "loopback": "offer", "from": "alice", "to": "bob" });
        let accepted = bob.manager.accept_connection("alice", "Alice", offer).await.unwrap();
        assert_eq!(accepted.role, Role::Responder);
        assert_eq!(mailbox.pending("alice"), 1);

        match next_event(&mut bob).await {
            ManagerEvent::Failed { peer_id, reason } => {
                assert_eq!(peer_id, "alice");
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(started_at.elapsed() >= DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(bob.manager.connection("alice").unwrap().state, ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_after_connect_is_terminal() {
        let network = LoopbackNetwork::new();
        let (mut alice, _bob, _mailbox) = connected_pair(&network).await;

        assert!(network.drop_link("alice", "bob", "ice path lost"));
        assert_eq!(
            next_event(&mut alice).await,
            ManagerEvent::Failed {
                peer_id: "bob".into(),
                reason: "ice path lost".into(),
            }
        );
        assert_eq!(alice.manager.connection("bob").unwrap().state, ConnectionState::Error);
        assert_eq!(alice.manager.active_connection_count(), 0);
        assert!(!alice.manager.send_message("bob", "anyone?").await);
    }

    #[tokio::test(start_paused = true)]
    async fn one_drain_routes_answers_for_every_pending_connection() {
        let mailbox = Arc::new(SignalMailbox::default());
        let network = LoopbackNetwork::new();
        let mut alice = side("alice", &mailbox, &network);
        let bob = side("bob", &mailbox, &network);
        let carol = side("carol", &mailbox, &network);

        alice.manager.initiate_connection("bob", "Bob").await.unwrap();
        alice.manager.initiate_connection("carol", "Carol").await.unwrap();
        for (responder, own_id) in [(&bob, "bob"), (&carol, "carol")] {
            let offer = mailbox.drain_all(own_id).pop().unwrap();
            responder
                .manager
                .accept_connection("alice", "Alice", offer.payload)
                .await
                .unwrap();
        }
        assert_eq!(mailbox.pending("alice"), 2);

        alice.manager.poll_incoming().await;
        assert_eq!(mailbox.pending("alice"), 0);
        let mut connected = Vec::new();
        for _ in 0..2 {
            match next_event(&mut alice).await {
                ManagerEvent::Connected { peer_id } => connected.push(peer_id),
                other => panic!("expected connected, got {other:?}"),
            }
        }
        connected.sort();
        assert_eq!(connected, vec!["bob", "carol"]);

        mailbox.append(
            "alice",
            SignalMessage::new("carol", "alice", SignalKind::Candidate, serde_json::json!({"loopback": "candidate"})),
        );
        let stranger_offer = serde_json::json!({ "loopback": "offer", "from": "dave", "to": "alice" });
        mailbox.append(
            "alice",
            SignalMessage::new("dave", "alice", SignalKind::Offer, stranger_offer.clone()),
        );
        alice.manager.poll_incoming().await;

        assert_eq!(
            next_event(&mut alice).await,
            ManagerEvent::IncomingOffer {
                from: "dave".into(),
                payload: stranger_offer,
            }
        );
        assert!(alice.events.try_recv().is_err());
        assert_eq!(alice.manager.active_connection_count(), 2);
    }
}
