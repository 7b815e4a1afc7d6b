//! Connector that pairs two links inside one process.
//!
//! Offers and answers are opaque tokens registered with a shared
//! [`MemoryConnector`]; any two sessions holding clones of the same connector
//! can negotiate with each other. Messages are delivered in order straight to
//! the remote link's event sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use uuid::Uuid;

use super::link::{
    ConnectivityState, Connector, DataLink, LinkEvent, LinkEventSink, Negotiated, PeerId,
};

#[derive(Default)]
struct Network {
    pending_offers: Mutex<HashMap<String, Arc<MemoryLink>>>,
    binary_frames: AtomicUsize,
    text_frames: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    network: Arc<Network>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binary frames sent by any link on this connector
    pub fn binary_frames(&self) -> usize {
        self.network.binary_frames.load(Ordering::SeqCst)
    }

    pub fn text_frames(&self) -> usize {
        self.network.text_frames.load(Ordering::SeqCst)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryLink>>> {
        self.network
            .pending_offers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn host_descriptor(port: u16) -> String {
    format!(
        r#"{{"candidate":"candidate:1 1 udp 2122260223 127.0.0.1 {} typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        port
    )
}

impl Connector for MemoryConnector {
    fn create_offer(&self, _peer: PeerId, events: LinkEventSink) -> BoxFuture<'_, Result<Negotiated>> {
        Box::pin(async move {
            let link = Arc::new(MemoryLink::new(events, self.network.clone()));
            let token = format!("memory-offer-{}", Uuid::new_v4());
            self.pending().insert(token.clone(), link.clone());

            // Trickled twice; the negotiator must drop the repeat
            link.events.emit(LinkEvent::LocalDescriptor(host_descriptor(40000)));
            link.events.emit(LinkEvent::LocalDescriptor(host_descriptor(40000)));
            link.events
                .emit(LinkEvent::ConnectionState(ConnectivityState::Connecting));

            Ok(Negotiated {
                link,
                description: token,
            })
        })
    }

    fn accept_offer(
        &self,
        _peer: PeerId,
        offer: String,
        events: LinkEventSink,
    ) -> BoxFuture<'_, Result<Negotiated>> {
        Box::pin(async move {
            let initiator = self
                .pending()
                .remove(&offer)
                .ok_or_else(|| anyhow!("unknown offer"))?;
            let responder = Arc::new(MemoryLink::new(events, self.network.clone()));

            let answer = format!("memory-answer-{}", Uuid::new_v4());
            responder.pair_with(&initiator);
            initiator.pair_with(&responder);
            *initiator.lock_expected() = Some(answer.clone());

            responder
                .events
                .emit(LinkEvent::LocalDescriptor(host_descriptor(40001)));
            responder
                .events
                .emit(LinkEvent::ConnectionState(ConnectivityState::Connecting));

            Ok(Negotiated {
                link: responder,
                description: answer,
            })
        })
    }
}

pub struct MemoryLink {
    events: LinkEventSink,
    network: Arc<Network>,
    remote: Mutex<Option<Weak<MemoryLink>>>,
    expected_answer: Mutex<Option<String>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLink {
    fn new(events: LinkEventSink, network: Arc<Network>) -> Self {
        Self {
            events,
            network,
            remote: Mutex::new(None),
            expected_answer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_expected(&self) -> MutexGuard<'_, Option<String>> {
        self.expected_answer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pair_with(&self, other: &Arc<MemoryLink>) {
        *self
            .remote
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::downgrade(other));
    }

    fn remote(&self) -> Option<Arc<MemoryLink>> {
        self.remote
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn mark_open(&self) {
        if self.closed.load(Ordering::SeqCst) || self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events
            .emit(LinkEvent::ConnectionState(ConnectivityState::Connected));
        self.events.emit(LinkEvent::ChannelOpen);
    }

    fn remote_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(LinkEvent::ChannelClosed);
        }
    }

    fn deliver(&self, message: LinkEvent) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            bail!("channel not open");
        }
        let remote = self.remote().ok_or_else(|| anyhow!("remote link dropped"))?;
        if remote.closed.load(Ordering::SeqCst) {
            bail!("remote channel closed");
        }
        remote.events.emit(message);
        Ok(())
    }
}

impl DataLink for MemoryLink {
    fn apply_answer(&self, answer: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.lock_expected().as_deref() != Some(answer.as_str()) {
                bail!("answer does not match this offer");
            }
            let remote = self.remote().ok_or_else(|| anyhow!("remote link dropped"))?;
            remote.mark_open();
            self.mark_open();
            Ok(())
        })
    }

    fn add_remote_descriptor(&self, descriptor: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if descriptor.is_empty() {
                bail!("empty descriptor");
            }
            Ok(())
        })
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.deliver(LinkEvent::Text(text))?;
            self.network.text_frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.deliver(LinkEvent::Binary(data))?;
            self.network.binary_frames.fetch_add(1, Ordering::SeqCst);
            // Let the other side's loop run between chunks
            tokio::task::yield_now().await;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                if let Some(remote) = self.remote() {
                    remote.remote_closed();
                }
            }
            Ok(())
        })
    }
}
