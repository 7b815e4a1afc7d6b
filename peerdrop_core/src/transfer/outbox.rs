use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::negotiation::link::{DataLink, LinkEventSink, PeerInput};
use crate::transfer::protocol::{ControlFrame, chunks};

/// Work queued for one peer's channel
pub enum Outbound {
    Control(ControlFrame),
    /// The whole file, sent as consecutive chunks
    Stream(Bytes),
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Control(frame) => f.debug_tuple("Control").field(frame).finish(),
            Outbound::Stream(data) => write!(f, "Stream({} bytes)", data.len()),
        }
    }
}

/// Sending half of a peer's writer task.
///
/// Frames go out strictly in the order they were queued. Dropping the outbox or
/// cancelling the token stops the writer between chunks.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn spawn(link: Arc<dyn DataLink>, events: LinkEventSink, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(link, rx, events, cancel));
        Self { tx }
    }

    pub fn send(&self, item: Outbound) -> bool {
        self.tx.send(item).is_ok()
    }
}

async fn run_writer(
    link: Arc<dyn DataLink>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    events: LinkEventSink,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let result = match item {
            Outbound::Control(frame) => match frame.encode() {
                Ok(text) => link.send_text(text).await,
                Err(e) => Err(e),
            },
            Outbound::Stream(data) => stream_file(link.as_ref(), &data, &events, &cancel).await,
        };

        if let Err(e) = result {
            warn!("Send to {} failed: {}", events.peer(), e);
            events.post(PeerInput::SendFailed(e.to_string()));
            break;
        }
    }
    debug!("Writer for {} stopped", events.peer());
}

async fn stream_file(
    link: &dyn DataLink,
    data: &Bytes,
    events: &LinkEventSink,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut offset = 0u64;
    for chunk in chunks(data) {
        if cancel.is_cancelled() {
            debug!("Stream to {} cancelled at {}", events.peer(), offset);
            return Ok(());
        }
        offset += chunk.len() as u64;
        link.send_binary(chunk).await?;
        events.post(PeerInput::ChunkSent { offset });
    }
    Ok(())
}
