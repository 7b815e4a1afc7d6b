//! WebSocket relay for session setup.
//!
//! Every socket is registered under a fresh id when it upgrades. Envelopes go
//! through [`RelayRouter`]; each connection has its own writer task fed by an
//! unbounded channel so one slow client never blocks routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use peerdrop_core::signaling::envelope::Envelope;
use peerdrop_core::signaling::routing::{Delivery, RelayRouter};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 5001;

#[derive(Default)]
struct Registry {
    router: RelayRouter,
    clients: HashMap<String, mpsc::UnboundedSender<Envelope>>,
}

impl Registry {
    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match self.clients.get(&delivery.to) {
                Some(tx) => {
                    let _ = tx.send(delivery.envelope);
                }
                None => tracing::debug!("Dropping envelope for departed {}", delivery.to),
            }
        }
    }
}

/// Connections and routing state shared by every socket
#[derive(Default)]
pub struct RelayState {
    registry: Mutex<Registry>,
}

impl RelayState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn connected(&self) -> usize {
        self.registry.lock().await.clients.len()
    }

    async fn join(&self, id: &str, tx: mpsc::UnboundedSender<Envelope>) {
        let mut registry = self.registry.lock().await;
        registry.router.register(id);
        registry.clients.insert(id.to_string(), tx);
    }

    async fn route(&self, from: &str, envelope: Envelope) {
        let mut registry = self.registry.lock().await;
        let deliveries = registry.router.route(from, envelope);
        registry.deliver(deliveries);
    }

    async fn leave(&self, id: &str) {
        let mut registry = self.registry.lock().await;
        registry.clients.remove(id);
        let notices = registry.router.unregister(id);
        registry.deliver(notices);
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

pub fn create_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let id = Uuid::new_v4().simple().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    state.join(&id, tx).await;
    tracing::info!("Client {} connected", id);

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode envelope for {}: {}", writer_id, e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                tracing::warn!("Write to {} failed: {}", writer_id, e);
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match Envelope::from_json(text.as_str()) {
                Ok(envelope) => {
                    tracing::debug!("{:?} from {}", envelope.action, id);
                    state.route(&id, envelope).await;
                }
                Err(e) => tracing::warn!("Malformed message from {}: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Socket error from {}: {}", id, e);
                break;
            }
        }
    }

    state.leave(&id).await;
    writer.abort();
    tracing::info!("Client {} disconnected", id);
}

/// Serve the relay on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Relay listening on ws://{}/ws", addr);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Relay shutting down gracefully");
        })
        .await?;
    Ok(())
}

/// `0.0.0.0:<PORT>`, falling back to the default port
pub fn bind_addr(port: Option<&str>) -> SocketAddr {
    let port = port
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    SocketAddr::from(([0, 0, 0, 0], port))
}
