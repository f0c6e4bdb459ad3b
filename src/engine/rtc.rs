//! Negotiation engine backed by the `webrtc` crate.
//!
//! Works non-trickle: the offer and answer are only handed out once ICE
//! gathering has completed, so every candidate travels inside the session
//! description and the mailbox carries exactly one message per direction.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{EngineEvent, EngineEventSender, EngineFactory, NegotiationEngine};
use crate::connection::Role;
use crate::error::{Error, Result};

const CHANNEL_LABEL: &str = "chat";

/// Creates [`WebRtcEngine`]s. On a LAN no STUN/TURN servers are needed, so
/// the default list is empty.
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngineFactory {
    pub ice_servers: Vec<String>,
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn NegotiationEngine>> {
        let pc = create_peer_connection(&self.ice_servers).await?;
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        let state_events = events.clone();
        let state_peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer_id = state_peer.clone();
            Box::pin(async move {
                tracing::debug!("Peer connection to {} is now {:?}", peer_id, state);
                match state {
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(EngineEvent::Error("peer connection failed".into()));
                    }
                    RTCPeerConnectionState::Closed => {
                        let _ = events.send(EngineEvent::Closed);
                    }
                    _ => {}
                }
            })
        }));

        match role {
            Role::Initiator => {
                let dc = pc
                    .create_data_channel(
                        CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                wire_channel(&dc, events.clone());
                *channel.lock() = Some(dc);
            }
            Role::Responder => {
                let slot = channel.clone();
                let dc_events = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = dc_events.clone();
                    Box::pin(async move {
                        if dc.label() != CHANNEL_LABEL {
                            tracing::debug!("Ignoring unexpected data channel {}", dc.label());
                            return;
                        }
                        wire_channel(&dc, events);
                        *slot.lock() = Some(dc);
                    })
                }));
            }
        }

        tracing::debug!("Created WebRTC engine {} -> {} as {:?}", local_id, peer_id, role);
        Ok(Arc::new(WebRtcEngine {
            pc,
            channel,
            events,
        }))
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: EngineEventSender,
}

impl WebRtcEngine {
    /// Sets `description` locally, waits for ICE gathering and returns the
    /// complete description as JSON.
    async fn finish_local_description(&self, description: RTCSessionDescription) -> Result<serde_json::Value> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await?;
        let _ = gather_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after gathering".into()))?;
        Ok(serde_json::to_value(local)?)
    }

    fn report<T>(&self, result: std::result::Result<T, webrtc::Error>) -> Result<T> {
        result.map_err(|err| {
            let _ = self.events.send(EngineEvent::Error(err.to_string()));
            Error::from(err)
        })
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<serde_json::Value> {
        let offer = self.report(self.pc.create_offer(None).await)?;
        self.finish_local_description(offer).await
    }

    async fn create_answer(&self, offer: serde_json::Value) -> Result<serde_json::Value> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.report(self.pc.set_remote_description(offer).await)?;
        let answer = self.report(self.pc.create_answer(None).await)?;
        self.finish_local_description(answer).await
    }

    async fn apply_remote_signal(&self, signal: serde_json::Value) -> Result<()> {
        if signal.get("sdp").is_some() {
            let description: RTCSessionDescription = serde_json::from_value(signal)?;
            self.report(self.pc.set_remote_description(description).await)
        } else if signal.get("candidate").is_some() {
            let candidate: RTCIceCandidateInit = serde_json::from_value(signal)?;
            self.report(self.pc.add_ice_candidate(candidate).await)
        } else {
            Err(Error::Negotiation(format!("unrecognised signal payload: {}", signal)))
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| Error::Negotiation("data channel not open".into()))?;
        let text = String::from_utf8_lossy(data).into_owned();
        dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) {
        let channel = self.channel.lock().take();
        if let Some(dc) = channel {
            let _ = dc.close().await;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!("Error closing peer connection: {}", err);
        }
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: EngineEventSender) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::Connected);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::Data(msg.data.to_vec()));
        })
    }));

    dc.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::Closed);
        })
    }));
}

async fn create_peer_connection(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        },
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}
