#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peerdrop_core::negotiation::memory::MemoryConnector;
use peerdrop_core::signaling::memory::MemoryRelay;
use peerdrop_core::{
    AccessPolicy, FileMetadata, Role, SessionEvent, SessionHandle, SessionOptions,
    SessionSnapshot, SharedFile,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Shared in-process relay and connector for one test
#[derive(Clone, Default)]
pub struct Network {
    pub relay: MemoryRelay,
    pub connector: MemoryConnector,
}

pub struct Peer {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
}

impl Peer {
    /// Wait for the first event matching `pred`, skipping the rest
    pub async fn wait_for<F>(&mut self, what: &str, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream ended while waiting for {}", what),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    /// Collect every event up to and including the first match
    pub async fn collect_until<F>(&mut self, what: &str, mut pred: F) -> Vec<SessionEvent>
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let mut seen = Vec::new();
        timeout(EVENT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            return;
                        }
                    }
                    None => panic!("event stream ended while waiting for {}", what),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
        seen
    }
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(&self, role: Role, options: SessionOptions) -> Peer {
        let (handle, events) = SessionHandle::spawn(
            role,
            options,
            Arc::new(self.connector.clone()),
            self.relay.connect(),
        );
        Peer { handle, events }
    }

    /// A sender with a session id and an active share
    pub async fn sender(
        &self,
        file: SharedFile,
        policy: AccessPolicy,
        options: SessionOptions,
    ) -> (Peer, String) {
        let mut peer = self.spawn(Role::Sender, options);
        peer.wait_for("relay", |e| matches!(e, SessionEvent::RelayConnected))
            .await;
        peer.handle.create_session().await.unwrap();
        let session_id = match peer
            .wait_for("session id", |e| matches!(e, SessionEvent::SessionCreated { .. }))
            .await
        {
            SessionEvent::SessionCreated { session_id } => session_id,
            _ => unreachable!(),
        };
        peer.handle.share_file(file, policy).await.unwrap();
        (peer, session_id)
    }

    /// A receiver that has joined `session_id` and holds its metadata
    pub async fn receiver(&self, session_id: &str, options: SessionOptions) -> (Peer, FileMetadata) {
        let mut peer = self.spawn(Role::Receiver, options);
        peer.wait_for("relay", |e| matches!(e, SessionEvent::RelayConnected))
            .await;
        peer.handle.join_session(session_id).await.unwrap();
        let metadata = match peer
            .wait_for("metadata", |e| matches!(e, SessionEvent::MetadataReceived(_)))
            .await
        {
            SessionEvent::MetadataReceived(metadata) => metadata,
            _ => unreachable!(),
        };
        (peer, metadata)
    }

    pub fn spawn_receiver(&self) -> Peer {
        self.spawn(Role::Receiver, SessionOptions::default())
    }
}

pub fn progress_of(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::TransferProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

/// Wait until the published snapshot satisfies `pred`
pub async fn wait_snapshot<F>(handle: &SessionHandle, what: &str, pred: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx = handle.watch();
    let snapshot = timeout(EVENT_TIMEOUT, rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("session loop stopped")
        .clone();
    snapshot
}
