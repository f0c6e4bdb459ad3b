//! Two managers negotiating through a real directory over HTTP.

use peerlink_lib::engine::LoopbackNetwork;
use peerlink_lib::protocol::LocalDevice;
use peerlink_lib::server;
use peerlink_lib::{
    AppState, ConnectionManager, ConnectionState, Direction, DirectoryClient, ManagerConfig, ManagerEvent,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_directory() -> String {
    let device = LocalDevice {
        name: "hub".into(),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    };
    let state = AppState::new(device, Duration::from_secs(60), 64);
    let app = server::router(state, &["http://localhost:5173".to_string()]).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(server::serve(listener, app, std::future::pending()));
    url
}

fn manager(
    id: &str,
    url: &str,
    network: &Arc<LoopbackNetwork>,
) -> (ConnectionManager, mpsc::UnboundedReceiver<ManagerEvent>) {
    let relay = DirectoryClient::new(url, Duration::from_secs(3)).unwrap();
    let config = ManagerConfig {
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    };
    ConnectionManager::new(id, Arc::new(relay), Arc::new(Arc::clone(network)), config)
}

async fn next(events: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn offer_answer_and_chat_over_http_mailbox() {
    let url = spawn_directory().await;
    let network = LoopbackNetwork::new();
    let (alice, mut alice_events) = manager("alice-alice.local.", &url, &network);
    let (bob, mut bob_events) = manager("bob-bob.local.", &url, &network);

    alice.initiate_connection("bob-bob.local.", "bob").await.unwrap();

    bob.poll_incoming().await;
    let offer = match next(&mut bob_events).await {
        ManagerEvent::IncomingOffer { from, payload } => {
            assert_eq!(from, "alice-alice.local.");
            payload
        }
        other => panic!("expected an offer, got {other:?}"),
    };
    let accepted = bob.accept_connection("alice-alice.local.", "alice", offer).await.unwrap();
    assert_eq!(accepted.id, "alice-alice.local.-bob-bob.local.");

    assert!(matches!(next(&mut alice_events).await, ManagerEvent::Connected { .. }));
    assert!(matches!(next(&mut bob_events).await, ManagerEvent::Connected { .. }));
    assert_eq!(alice.active_connection_count(), 1);

    assert!(alice.send_message("bob-bob.local.", "ping").await);
    match next(&mut bob_events).await {
        ManagerEvent::Message { entry, .. } => {
            assert_eq!(entry.text, "ping");
            assert_eq!(entry.direction, Direction::Remote);
        }
        other => panic!("expected a message, got {other:?}"),
    }

    bob.close_connection("alice-alice.local.").await;
    assert!(matches!(next(&mut alice_events).await, ManagerEvent::Disconnected { .. }));
    assert!(matches!(next(&mut bob_events).await, ManagerEvent::Disconnected { .. }));
    assert!(alice.connections().is_empty());
}

#[tokio::test]
async fn unreachable_directory_fails_the_offer() {
    let network = LoopbackNetwork::new();
    // Nothing listens on the discard port.
    let (alice, mut events) = manager("alice", "http://127.0.0.1:9", &network);

    assert!(alice.initiate_connection("bob", "bob").await.is_err());
    assert!(matches!(next(&mut events).await, ManagerEvent::Failed { .. }));
    assert_eq!(alice.connection("bob").unwrap().state, ConnectionState::Error);
}
