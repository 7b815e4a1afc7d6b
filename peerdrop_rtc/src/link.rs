use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use peerdrop_core::{DataLink, LinkEvent, LinkEventSink};
use tokio::sync::RwLock;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::{decode_candidate, decode_description};

/// Pause sending while more than this is queued on the channel
const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Report channel lifecycle and messages on `events`, then keep the channel
pub(crate) async fn attach_channel(slot: &ChannelSlot, dc: Arc<RTCDataChannel>, events: LinkEventSink) {
    let opened = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            opened.emit(LinkEvent::ChannelOpen);
        })
    }));

    let closed = events.clone();
    dc.on_close(Box::new(move || {
        let closed = closed.clone();
        Box::pin(async move {
            closed.emit(LinkEvent::ChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if !msg.is_string {
                events.emit(LinkEvent::Binary(msg.data));
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => events.emit(LinkEvent::Text(text)),
                Err(_) => warn!("Non UTF-8 text message from {}, ignoring", events.peer()),
            }
        })
    }));

    *slot.write().await = Some(dc);
}

/// One peer connection and its data channel
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl RtcLink {
    pub(crate) fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            channel: Arc::new(RwLock::new(None)),
        }
    }

    pub(crate) fn slot(&self) -> ChannelSlot {
        self.channel.clone()
    }

    async fn open_channel(&self) -> Result<Arc<RTCDataChannel>> {
        let dc = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("data channel not established"))?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            bail!("data channel is {}", state);
        }
        Ok(dc)
    }

    async fn wait_for_room(dc: &RTCDataChannel) -> Result<()> {
        let started = Instant::now();
        loop {
            let buffered = dc.buffered_amount().await;
            if buffered <= MAX_BUFFERED_AMOUNT {
                return Ok(());
            }
            if started.elapsed() > DRAIN_TIMEOUT {
                bail!("data channel buffer did not drain ({} bytes queued)", buffered);
            }
            debug!("Waiting for {} buffered bytes to drain", buffered);
            sleep(DRAIN_POLL).await;
        }
    }
}

impl DataLink for RtcLink {
    fn apply_answer(&self, answer: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let description = decode_description(&answer)?;
            self.pc
                .set_remote_description(description)
                .await
                .context("set remote description")?;
            Ok(())
        })
    }

    fn add_remote_descriptor(&self, descriptor: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let candidate = decode_candidate(&descriptor)?;
            self.pc
                .add_ice_candidate(candidate)
                .await
                .context("add ice candidate")?;
            Ok(())
        })
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let dc = self.open_channel().await?;
            dc.send_text(text).await.context("send text frame")?;
            Ok(())
        })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let dc = self.open_channel().await?;
            Self::wait_for_room(&dc).await?;
            dc.send(&data).await.context("send binary frame")?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.pc.close().await.context("close peer connection")?;
            Ok(())
        })
    }
}
