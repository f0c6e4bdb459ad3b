pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod manager;
pub mod peer;
pub mod poller;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod state;

pub use client::DirectoryClient;
pub use config::{Cli, Config};
pub use connection::{ChatEntry, Connection, ConnectionState, Direction, Role};
pub use directory::PeerDirectory;
pub use error::{Error, Result};
pub use mailbox::SignalMailbox;
pub use manager::{ConnectionManager, ManagerConfig, ManagerEvent};
pub use poller::{DiscoveryPoller, DiscoveryStatus, ListingSource, PollerConfig};
pub use relay::SignalRelay;
pub use state::AppState;

use clap::Parser;
use discovery::Discovery;
use engine::WebRtcEngineFactory;
use protocol::LocalDevice;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub fn run() {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("peerlink: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init(&config.log) {
        eprintln!("peerlink: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_async(config)) {
        tracing::error!("peerlink stopped: {}", e);
        std::process::exit(1);
    }
}

/// Runs the directory until Ctrl-C: announce, browse, sweep, serve, and
/// answer offers addressed to this device.
pub async fn run_async(config: Config) -> Result<()> {
    let ip = local_ip_address::local_ip().unwrap_or_else(|e| {
        tracing::warn!("Could not determine local IP, using loopback: {}", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    });
    let device = LocalDevice {
        name: config.device_name.clone(),
        ip,
        port: config.port,
    };
    tracing::info!("Starting peerlink as {} on {}:{}", device.name, device.ip, device.port);

    let state = AppState::new(device, config.stale_after, config.mailbox_capacity);

    // Re-browse well inside the staleness window so live peers stay fresh
    let browse_refresh = config.sweep_interval.min(config.stale_after / 2);
    if let Err(e) = start_discovery(&state, &config.service_class, browse_refresh) {
        tracing::error!("Discovery unavailable, serving without announcements: {}", e);
    }
    let sweeper = state.directory.spawn_sweeper(config.sweep_interval);
    let janitor = state.mailbox.spawn_janitor(config.sweep_interval, config.mailbox_idle);

    let manager_config = ManagerConfig::default();
    let poll_interval = manager_config.poll_interval;
    let (manager, events) = ConnectionManager::new(
        discovery::local_peer_id(&state.local_device.name),
        Arc::new(Arc::clone(&state.mailbox)),
        Arc::new(WebRtcEngineFactory::default()),
        manager_config,
    );
    let node = tokio::spawn(run_node(
        manager.clone(),
        events,
        Arc::clone(&state.directory),
        config.auto_accept,
        poll_interval,
    ));

    let app = server::router(state.clone(), &config.allowed_origins)?;
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;

    let shutdown_state = state.clone();
    let shutdown_manager = manager.clone();
    server::serve(listener, app, async move {
        shutdown_signal().await;
        tracing::info!("Shutting down");
        shutdown_state.unpublish().await;
        shutdown_manager.close_all_connections().await;
    })
    .await?;

    node.abort();
    sweeper.abort();
    janitor.abort();
    Ok(())
}

fn start_discovery(state: &AppState, service_class: &str, refresh_every: Duration) -> Result<()> {
    let mut discovery = Discovery::new(service_class)?;
    discovery.publish(&state.local_device)?;
    let events = discovery.browse(refresh_every)?;
    tracing::info!(
        "Browsing {} (refreshing every {:?})",
        discovery.service_type(),
        refresh_every
    );
    state.directory.spawn_ingest(events);
    *state.discovery.lock() = Some(discovery);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// This device's own side of the signaling: watches our mailbox for offers
/// and logs what arrives on accepted connections.
async fn run_node(
    manager: ConnectionManager,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    directory: Arc<PeerDirectory>,
    auto_accept: bool,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => manager.poll_incoming().await,
            event = events.recv() => match event {
                Some(ManagerEvent::IncomingOffer { from, payload }) => {
                    if !auto_accept {
                        tracing::info!("Ignoring offer from {}, auto-accept is off", from);
                        continue;
                    }
                    let name = directory
                        .list_active()
                        .into_iter()
                        .find(|record| record.id == from)
                        .map(|record| record.display_name)
                        .unwrap_or_else(|| from.clone());
                    if let Err(e) = manager.accept_connection(&from, &name, payload).await {
                        tracing::warn!("Failed to accept offer from {}: {}", from, e);
                    }
                }
                Some(ManagerEvent::Message { peer_id, entry }) => {
                    tracing::info!("Message from {}: {}", peer_id, entry.text);
                }
                Some(other) => tracing::debug!("Connection event: {:?}", other),
                None => break,
            },
        }
    }
}
