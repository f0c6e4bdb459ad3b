use crate::directory::PeerDirectory;
use crate::discovery::Discovery;
use crate::mailbox::SignalMailbox;
use crate::protocol::{LocalDevice, PeerListing, PeerSummary, StatusReport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared by every HTTP handler and the background tasks.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<PeerDirectory>,
    pub mailbox: Arc<SignalMailbox>,
    pub local_device: LocalDevice,
    // Discovery Service, absent when mDNS could not start
    pub discovery: Arc<Mutex<Option<Discovery>>>,
    started_at: Instant,
}

impl AppState {
    pub fn new(local_device: LocalDevice, stale_after: Duration, mailbox_capacity: usize) -> Self {
        Self {
            directory: Arc::new(PeerDirectory::new(local_device.ip, stale_after)),
            mailbox: Arc::new(SignalMailbox::new(mailbox_capacity)),
            local_device,
            discovery: Arc::new(Mutex::new(None)),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn listing(&self) -> PeerListing {
        let peers: Vec<PeerSummary> = self
            .directory
            .list_active()
            .iter()
            .map(PeerSummary::from)
            .collect();
        PeerListing {
            local_device: self.local_device.clone(),
            count: peers.len(),
            peers,
        }
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            status: "running".to_string(),
            local_device: self.local_device.clone(),
            peers_count: self.directory.len(),
            uptime: self.uptime().as_secs_f64(),
        }
    }

    /// Withdraws the mDNS announcement, if any. Safe to call more than once.
    pub async fn unpublish(&self) {
        let discovery = self.discovery.lock().take();
        if let Some(mut discovery) = discovery {
            if let Err(e) = discovery.unpublish().await {
                tracing::warn!("Failed to unpublish announcement: {}", e);
            }
        }
    }
}
