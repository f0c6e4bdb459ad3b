//! Per-recipient store-and-forward queue for handshake messages.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::protocol::SignalMessage;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// A recipient whose newest message is older than this never came back for
/// it. Four times the handshake deadline.
pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(120);

pub struct SignalMailbox {
    queues: Mutex<HashMap<String, VecDeque<SignalMessage>>>,
    capacity: usize,
}

impl SignalMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends to the tail of `to`'s queue. When the queue is full the oldest
    /// message is dropped and returned.
    pub fn append(&self, to: &str, message: SignalMessage) -> Option<SignalMessage> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(to.to_string()).or_default();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        drop(queues);

        if let Some(old) = &dropped {
            tracing::warn!("Mailbox for {} is full, dropped message {}", to, old.id);
        }
        dropped
    }

    /// Swaps the recipient's queue for an empty one and returns what it held,
    /// in arrival order.
    pub fn drain_all(&self, recipient: &str) -> Vec<SignalMessage> {
        let drained = self
            .queues
            .lock()
            .remove(recipient)
            .map(Vec::from)
            .unwrap_or_default();
        if !drained.is_empty() {
            tracing::debug!("Drained {} message(s) for {}", drained.len(), recipient);
        }
        drained
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.queues.lock().get(recipient).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    pub fn recipients(&self) -> usize {
        self.queues.lock().len()
    }

    /// Drops every queue whose newest message was created more than
    /// `max_idle` before `now`. Returns how many recipients were dropped.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let window = chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut evicted = Vec::new();
        self.queues.lock().retain(|recipient, queue| {
            let idle = queue
                .back()
                .map_or(true, |newest| now.signed_duration_since(newest.created_at) > window);
            if idle {
                evicted.push((recipient.clone(), queue.len()));
            }
            !idle
        });

        for (recipient, count) in &evicted {
            tracing::info!("Dropped {} unclaimed message(s) for {}", count, recipient);
        }
        evicted.len()
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `interval` until the task
    /// is aborted.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let mailbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                mailbox.evict_idle(Utc::now(), max_idle);
            }
        })
    }
}

impl Default for SignalMailbox {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}
