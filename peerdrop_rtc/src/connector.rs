use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use peerdrop_core::{Connector, LinkEvent, LinkEventSink, Negotiated, PeerId};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::link::{RtcLink, attach_channel};
use crate::{CHANNEL_LABEL, connectivity, decode_description, encode_candidate, encode_description, ice_servers};

/// Builds one `RTCPeerConnection` per peer
pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(ice_server_urls: &[String]) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers: ice_servers(ice_server_urls),
                ..Default::default()
            },
        })
    }

    async fn peer_connection(&self, peer: &str, events: &LinkEventSink) -> Result<Arc<RTCPeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .context("create peer connection")?,
        );

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match encode_candidate(&candidate) {
                    Ok(raw) => candidates.emit(LinkEvent::LocalDescriptor(raw)),
                    Err(e) => warn!("Dropping local candidate: {:#}", e),
                }
            })
        }));

        let states = events.clone();
        let peer = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let states = states.clone();
            let peer = peer.clone();
            Box::pin(async move {
                debug!("Peer connection to {} is {}", peer, state);
                if let Some(state) = connectivity(state) {
                    states.emit(LinkEvent::ConnectionState(state));
                }
            })
        }));

        Ok(pc)
    }
}

impl Connector for RtcConnector {
    fn create_offer(&self, peer: PeerId, events: LinkEventSink) -> BoxFuture<'_, Result<Negotiated>> {
        Box::pin(async move {
            let pc = self.peer_connection(&peer, &events).await?;
            let link = Arc::new(RtcLink::new(pc.clone()));

            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(CHANNEL_LABEL, Some(init))
                .await
                .context("create data channel")?;
            attach_channel(&link.slot(), dc, events).await;

            let offer = pc.create_offer(None).await.context("create offer")?;
            let description = encode_description(&offer)?;
            pc.set_local_description(offer)
                .await
                .context("set local description")?;

            info!("Offer ready for {}", peer);
            Ok(Negotiated { link, description })
        })
    }

    fn accept_offer(
        &self,
        peer: PeerId,
        offer: String,
        events: LinkEventSink,
    ) -> BoxFuture<'_, Result<Negotiated>> {
        Box::pin(async move {
            let offer = decode_description(&offer)?;
            let pc = self.peer_connection(&peer, &events).await?;
            let link = Arc::new(RtcLink::new(pc.clone()));

            let slot = link.slot();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let events = events.clone();
                Box::pin(async move {
                    if dc.label() != CHANNEL_LABEL {
                        warn!("Ignoring unexpected data channel {}", dc.label());
                        return;
                    }
                    attach_channel(&slot, dc, events).await;
                })
            }));

            pc.set_remote_description(offer)
                .await
                .context("set remote description")?;
            let answer = pc.create_answer(None).await.context("create answer")?;
            let description = encode_description(&answer)?;
            pc.set_local_description(answer)
                .await
                .context("set local description")?;

            info!("Answer ready for {}", peer);
            Ok(Negotiated { link, description })
        })
    }
}
