//! Keeps a fresh copy of a directory's peer listing.
//!
//! The poller fetches on a base interval. After `failure_threshold`
//! consecutive failures it pings the directory's status endpoint; if that
//! fails too it stretches the interval by `backoff_multiplier` until a fetch
//! succeeds again. Observers read [`DiscoveryStatus`] through a watch channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{PeerListing, PeerSummary};

/// Where listings come from. [`crate::client::DirectoryClient`] is the real one.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listing(&self) -> Result<PeerListing>;

    /// Cheap liveness check, used once fetches keep failing.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub base_interval: Duration,
    pub request_timeout: Duration,
    pub failure_threshold: u32,
    pub backoff_multiplier: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            failure_threshold: 3,
            backoff_multiplier: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryStatus {
    pub listing: Option<PeerListing>,
    pub loading: bool,
    pub last_error: Option<String>,
    pub directory_reachable: bool,
    pub consecutive_failures: u32,
    pub last_successful_fetch: Option<DateTime<Utc>>,
    pub backing_off: bool,
}

impl DiscoveryStatus {
    pub fn peers(&self) -> &[PeerSummary] {
        self.listing
            .as_ref()
            .map(|listing| listing.peers.as_slice())
            .unwrap_or_default()
    }

    pub fn time_since_last_success(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_successful_fetch.map(|at| now - at)
    }
}

pub struct DiscoveryPoller {
    source: Arc<dyn ListingSource>,
    config: PollerConfig,
    status: watch::Sender<DiscoveryStatus>,
    refresh_requested: Notify,
}

impl DiscoveryPoller {
    pub fn new(source: Arc<dyn ListingSource>, config: PollerConfig) -> Self {
        let (status, _) = watch::channel(DiscoveryStatus::default());
        Self {
            source,
            config,
            status,
            refresh_requested: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status.borrow().clone()
    }

    /// One bounded fetch. Success resets the failure counter; failure clears
    /// the listing and bumps it.
    pub async fn fetch_snapshot(&self) -> Result<PeerListing> {
        self.status.send_modify(|status| status.loading = true);

        let fetched = tokio::time::timeout(self.config.request_timeout, self.source.fetch_listing())
            .await
            .unwrap_or(Err(Error::Timeout(self.config.request_timeout)));

        match fetched {
            Ok(listing) => {
                tracing::debug!("Fetched peer listing with {} peer(s)", listing.count);
                let snapshot = listing.clone();
                self.status.send_modify(move |status| {
                    status.listing = Some(snapshot);
                    status.loading = false;
                    status.last_error = None;
                    status.directory_reachable = true;
                    status.consecutive_failures = 0;
                    status.last_successful_fetch = Some(Utc::now());
                    status.backing_off = false;
                });
                Ok(listing)
            }
            Err(err) => {
                let message = err.to_string();
                self.status.send_modify(|status| {
                    status.listing = None;
                    status.loading = false;
                    status.last_error = Some(message);
                    status.directory_reachable = false;
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                });
                tracing::debug!(
                    "Peer listing fetch failed ({} in a row): {}",
                    self.status.borrow().consecutive_failures,
                    err
                );
                Err(err)
            }
        }
    }

    /// Fetches once and returns how long to wait before the next attempt.
    pub async fn poll_once(&self) -> Duration {
        let base = self.config.base_interval;
        if self.fetch_snapshot().await.is_ok() {
            return base;
        }
        if self.status.borrow().consecutive_failures < self.config.failure_threshold {
            return base;
        }

        let pinged = tokio::time::timeout(self.config.request_timeout, self.source.ping()).await;
        match pinged {
            Ok(Ok(())) => {
                tracing::info!("Directory answers pings, keeping base interval");
                self.status.send_modify(|status| {
                    status.directory_reachable = true;
                    status.backing_off = false;
                });
                base
            }
            _ => {
                let stretched = base * self.config.backoff_multiplier;
                let was_backing_off = self.status.borrow().backing_off;
                if !was_backing_off {
                    tracing::warn!("Directory unreachable, backing off to {:?}", stretched);
                }
                self.status.send_modify(|status| {
                    status.directory_reachable = false;
                    status.backing_off = true;
                });
                stretched
            }
        }
    }

    /// Resets the failure counter and wakes the poll loop for an immediate
    /// fetch, skipping any backoff in progress.
    pub fn refresh(&self) {
        self.status.send_modify(|status| {
            status.consecutive_failures = 0;
            status.backing_off = false;
        });
        self.refresh_requested.notify_one();
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delay = self.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.refresh_requested.notified() => {
                        tracing::debug!("Manual refresh");
                    }
                }
            }
        })
    }
}
