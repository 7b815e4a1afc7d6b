use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::relay::{RelayChannels, RelayEvent};
use super::routing::{Delivery, RelayRouter};

#[derive(Default)]
struct Hub {
    router: RelayRouter,
    members: HashMap<String, mpsc::UnboundedSender<RelayEvent>>,
}

impl Hub {
    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if let Some(tx) = self.members.get(&delivery.to) {
                let _ = tx.send(RelayEvent::Envelope(delivery.envelope));
            }
        }
    }

    fn leave(&mut self, id: &str) -> Option<mpsc::UnboundedSender<RelayEvent>> {
        let tx = self.members.remove(id)?;
        let notices = self.router.unregister(id);
        self.deliver(notices);
        Some(tx)
    }
}

/// In-process relay with the same routing rules as the WebSocket server
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new participant. `Connected` is already queued on its inbound side.
    pub fn connect(&self) -> RelayChannels {
        let id = Uuid::new_v4().simple().to_string();
        let (channels, mut out_rx, in_tx) = RelayChannels::pair();
        let _ = in_tx.send(RelayEvent::Connected);

        {
            let mut hub = self.hub();
            hub.router.register(&id);
            hub.members.insert(id.clone(), in_tx);
        }

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let mut hub = relay.hub();
                if !hub.members.contains_key(&id) {
                    break;
                }
                let deliveries = hub.router.route(&id, envelope);
                hub.deliver(deliveries);
            }
            debug!("Memory relay participant {} left", id);
            relay.hub().leave(&id);
        });

        channels
    }

    /// Cut one participant off as if its socket dropped
    pub fn disconnect(&self, id: &str) {
        if let Some(tx) = self.hub().leave(id) {
            let _ = tx.send(RelayEvent::Closed(Some("relay dropped the connection".to_string())));
        }
    }

    pub fn participants(&self) -> usize {
        self.hub().members.len()
    }
}
