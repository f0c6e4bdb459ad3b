//! The set of peers currently visible on the local network.
//!
//! Records come in through [`PeerDirectory::apply`] (fed by the browse
//! stream) and leave either on an explicit `Down` or when the sweeper finds
//! them older than the staleness window. The sweeper exists because peers that
//! crash never send their goodbye.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::peer::{PeerEvent, PeerRecord};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const EVENT_BUFFER: usize = 64;

pub struct PeerDirectory {
    records: Mutex<HashMap<String, PeerRecord>>,
    local_address: IpAddr,
    stale_after: Duration,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerDirectory {
    pub fn new(local_address: IpAddr, stale_after: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: Mutex::new(HashMap::new()),
            local_address,
            stale_after,
            events,
        }
    }

    /// Membership changes as they are applied, including sweep evictions.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }


    fn is_self(&self, record: &PeerRecord) -> bool {
        let bare = record.address.split('%').next().unwrap_or(&record.address);
        bare.parse::<IpAddr>()
            .map(|ip| ip == self.local_address)
            .unwrap_or(false)
    }

    /// Applies one browse event. Returns true when the record set changed
    /// membership (a new peer appeared or a known one left).
    pub fn apply(&self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::Up(record) => {
                if self.is_self(&record) {
                    tracing::trace!("Ignoring our own announcement: {}", record.id);
                    return false;
                }
                let mut records = self.records.lock();
                let is_new = !records.contains_key(&record.id);
                records.insert(record.id.clone(), record.clone());
                drop(records);

                if is_new {
                    tracing::info!("Peer discovered: {} at {}:{}", record.id, record.address, record.port);
                    let _ = self.events.send(PeerEvent::Up(record));
                } else {
                    tracing::trace!("Peer refreshed: {}", record.id);
                }
                is_new
            }
            PeerEvent::Down(record) => {
                let removed = self.records.lock().remove(&record.id);
                match removed {
                    Some(removed) => {
                        tracing::info!("Peer left: {}", removed.id);
                        let _ = self.events.send(PeerEvent::Down(removed));
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Evicts every record last seen more than the staleness window before
    /// `now` and emits a synthetic `Down` for each.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let evicted: Vec<PeerRecord> = {
            let mut records = self.records.lock();
            let stale: Vec<String> = records
                .values()
                .filter(|record| now.signed_duration_since(record.last_seen_at) > window)
                .map(|record| record.id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| records.remove(id))
                .collect()
        };

        for record in &evicted {
            tracing::info!("Removed stale peer {} (last seen {})", record.id, record.last_seen_at);
            let _ = self.events.send(PeerEvent::Down(record.clone()));
        }
        evicted
    }

    /// Snapshot of the current peers, ordered by display name then id.
    pub fn list_active(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.records.lock().values().cloned().collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be stale yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                directory.sweep(Utc::now());
            }
        })
    }

    /// Feeds a browse stream into the directory until the stream ends.
    pub fn spawn_ingest<S>(self: &Arc<Self>, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = PeerEvent> + Send + 'static,
    {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                let id = event.record().id.clone();
                if directory.apply(event) {
                    tracing::debug!("Directory membership changed by {}", id);
                }
            }
            tracing::warn!("Browse stream ended, directory will only shrink from now on");
        })
    }
}
