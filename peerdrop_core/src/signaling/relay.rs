use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::envelope::Envelope;

/// What the relay connection reports to the session loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Envelope(Envelope),
    /// The connection ended; carries the reason when there was one
    Closed(Option<String>),
}

/// Both directions of one relay connection
#[derive(Debug)]
pub struct RelayChannels {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayChannels {
    /// A connected pair with no socket behind it
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedSender<RelayEvent>,
    ) {
        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (in_tx, inbound) = mpsc::unbounded_channel();
        (Self { outbound, inbound }, out_rx, in_tx)
    }
}

/// Open a WebSocket to the relay in the background.
///
/// Returns immediately; `RelayEvent::Connected` arrives once the socket is up.
pub fn connect_relay(url: &str) -> Result<RelayChannels> {
    let url = Url::parse(url).with_context(|| format!("invalid relay url {}", url))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        anyhow::bail!("relay url must use ws:// or wss://, got {}", url);
    }

    let (channels, out_rx, in_tx) = RelayChannels::pair();
    tokio::spawn(run_connection(url, out_rx, in_tx));
    Ok(channels)
}

async fn run_connection(
    url: Url,
    mut out_rx: mpsc::UnboundedReceiver<Envelope>,
    in_tx: mpsc::UnboundedSender<RelayEvent>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            error!("Relay connection to {} failed: {}", url, e);
            let _ = in_tx.send(RelayEvent::Closed(Some(e.to_string())));
            return;
        }
    };
    info!("Connected to relay {}", url);
    let _ = in_tx.send(RelayEvent::Connected);

    let (mut write, mut read) = ws.split();
    let reason = loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(envelope) = outgoing else {
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode envelope: {}", e);
                        continue;
                    }
                };
                debug!("Relay <- {:?}", envelope.action);
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    break Some(e.to_string());
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Envelope::from_json(text.as_str()) {
                    Ok(envelope) => {
                        debug!("Relay -> {:?}", envelope.action);
                        if in_tx.send(RelayEvent::Envelope(envelope)).is_err() {
                            break None;
                        }
                    }
                    Err(e) => warn!("Unparseable relay message ({}), skipping", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| f.reason.as_str().to_string()).filter(|r| !r.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
        }
    };

    info!("Relay connection closed");
    let _ = in_tx.send(RelayEvent::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_bad_urls() {
        assert!(connect_relay("not a url").is_err());
        assert!(connect_relay("http://localhost:5001/ws").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_closed() {
        // Port 9 (discard) is not listening in test environments
        let mut channels = connect_relay("ws://127.0.0.1:9/ws").unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), channels.inbound.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RelayEvent::Closed(Some(_)))));
    }
}
