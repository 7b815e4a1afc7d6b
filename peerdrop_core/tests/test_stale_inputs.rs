mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use common::{EVENT_TIMEOUT, Network, Peer, init_tracing, sample_bytes, wait_snapshot};
use futures_util::future::BoxFuture;
use peerdrop_core::negotiation::memory::MemoryConnector;
use peerdrop_core::signaling::envelope::{Action, Envelope};
use peerdrop_core::{
    AccessPolicy, Connector, DataLink, LinkEventSink, Negotiated, PeerId, RelayChannels,
    RelayEvent, Role, SessionEvent, SessionHandle, SessionOptions, SharedFile,
};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};

/// Wraps a link to record `close` and optionally hold binary sends
struct WrappedLink {
    inner: Arc<dyn DataLink>,
    closed: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
}

impl DataLink for WrappedLink {
    fn apply_answer(&self, answer: String) -> BoxFuture<'_, Result<()>> {
        self.inner.apply_answer(answer)
    }

    fn add_remote_descriptor(&self, descriptor: String) -> BoxFuture<'_, Result<()>> {
        self.inner.add_remote_descriptor(descriptor)
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>> {
        self.inner.send_text(text)
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            self.inner.send_binary(data).await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Offers wait for `release` (if set) and hand out wrapped links
struct TestConnector {
    inner: MemoryConnector,
    release: Option<Arc<Notify>>,
    gate: Option<Arc<Semaphore>>,
    closed: Arc<AtomicBool>,
}

impl TestConnector {
    fn new(inner: MemoryConnector) -> Self {
        Self {
            inner,
            release: None,
            gate: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Connector for TestConnector {
    fn create_offer(&self, peer: PeerId, events: LinkEventSink) -> BoxFuture<'_, Result<Negotiated>> {
        Box::pin(async move {
            if let Some(release) = &self.release {
                release.notified().await;
            }
            let negotiated = self.inner.create_offer(peer, events).await?;
            Ok(Negotiated {
                link: Arc::new(WrappedLink {
                    inner: negotiated.link,
                    closed: self.closed.clone(),
                    gate: self.gate.clone(),
                }),
                description: negotiated.description,
            })
        })
    }

    fn accept_offer(
        &self,
        peer: PeerId,
        offer: String,
        events: LinkEventSink,
    ) -> BoxFuture<'_, Result<Negotiated>> {
        self.inner.accept_offer(peer, offer, events)
    }
}

#[tokio::test]
async fn test_offer_resolving_after_teardown_is_discarded() {
    init_tracing();
    let release = Arc::new(Notify::new());
    let connector = Arc::new(TestConnector {
        release: Some(release.clone()),
        ..TestConnector::new(MemoryConnector::new())
    });
    let (channels, mut out_rx, in_tx) = RelayChannels::pair();
    let (handle, events) = SessionHandle::spawn(
        Role::Sender,
        SessionOptions::default(),
        connector.clone(),
        channels,
    );
    let mut sender = Peer { handle, events };

    // 1. Session up on a scripted relay
    in_tx.send(RelayEvent::Connected).unwrap();
    sender
        .wait_for("relay", |e| matches!(e, SessionEvent::RelayConnected))
        .await;
    sender.handle.create_session().await.unwrap();
    let create = timeout(EVENT_TIMEOUT, out_rx.recv()).await.unwrap().unwrap();
    assert_eq!(create.action, Action::CreateSession);
    in_tx
        .send(RelayEvent::Envelope(Envelope::session_created("s-1")))
        .unwrap();
    sender
        .wait_for("created", |e| matches!(e, SessionEvent::SessionCreated { .. }))
        .await;

    // 2. A peer joins and leaves while its offer is still being built
    let joined = Envelope {
        session_id: Some("r-1".to_string()),
        target: Some("s-1".to_string()),
        ..Envelope::new(Action::PeerJoined)
    };
    in_tx.send(RelayEvent::Envelope(joined)).unwrap();
    sender
        .wait_for("joined", |e| matches!(e, SessionEvent::PeerJoined { .. }))
        .await;
    in_tx
        .send(RelayEvent::Envelope(Envelope::peer_left("r-1")))
        .unwrap();
    sender
        .wait_for("left", |e| matches!(e, SessionEvent::PeerLeft { .. }))
        .await;

    // 3. The offer resolves late; its link is closed, nothing is relayed
    release.notify_one();
    timeout(EVENT_TIMEOUT, async {
        while !connector.closed.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late link was never closed");

    sender.handle.disconnect_peer("r-1").await.unwrap();
    let error = sender
        .wait_for("unknown peer", |e| matches!(e, SessionEvent::Error(_)))
        .await;
    assert!(matches!(error, SessionEvent::Error(m) if m.contains("unknown peer")));

    while let Ok(envelope) = out_rx.try_recv() {
        assert!(
            !matches!(envelope.action, Action::Offer | Action::Candidate),
            "relayed {:?} for a removed peer",
            envelope.action
        );
    }
    let snapshot = wait_snapshot(&sender.handle, "no peers", |s| s.peers.is_empty()).await;
    assert!(snapshot.peers.is_empty());
}

#[tokio::test]
async fn test_receipt_for_replaced_file_is_not_counted() {
    init_tracing();
    let net = Network::new();
    let gate = Arc::new(Semaphore::new(1));
    let connector = TestConnector {
        gate: Some(gate.clone()),
        ..TestConnector::new(net.connector.clone())
    };
    let (handle, events) = SessionHandle::spawn(
        Role::Sender,
        SessionOptions::default(),
        Arc::new(connector),
        net.relay.connect(),
    );
    let mut sender = Peer { handle, events };
    let first = sample_bytes(40_000);
    let second = vec![9u8; 20_000];

    // 1. Share the first file, the receiver starts fetching it
    sender
        .wait_for("relay", |e| matches!(e, SessionEvent::RelayConnected))
        .await;
    sender.handle.create_session().await.unwrap();
    let SessionEvent::SessionCreated { session_id } = sender
        .wait_for("session id", |e| matches!(e, SessionEvent::SessionCreated { .. }))
        .await
    else {
        unreachable!()
    };
    sender
        .handle
        .share_file(
            SharedFile::from_bytes("first.bin", first.clone()),
            AccessPolicy::with_limit(1),
        )
        .await
        .unwrap();

    let (mut receiver, metadata) = net.receiver(&session_id, SessionOptions::default()).await;
    assert_eq!(metadata.name, "first.bin");
    receiver.handle.request_download(None).await.unwrap();
    receiver
        .wait_for("first chunk", |e| {
            matches!(e, SessionEvent::TransferProgress { offset, .. } if *offset > 0)
        })
        .await;

    // 2. Replace the share while the first file is mid-stream
    sender
        .handle
        .share_file(
            SharedFile::from_bytes("second.bin", second.clone()),
            AccessPolicy::with_limit(1),
        )
        .await
        .unwrap();
    wait_snapshot(&sender.handle, "second share", |s| {
        s.metadata.as_ref().is_some_and(|m| m.name == "second.bin")
    })
    .await;
    gate.add_permits(100);

    // 3. The first file completes but is not counted; the second is offered
    let SessionEvent::FileReceived(file) = receiver
        .wait_for("first file", |e| matches!(e, SessionEvent::FileReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(&file.data[..], &first[..]);
    let SessionEvent::MetadataReceived(metadata) = receiver
        .wait_for("second metadata", |e| matches!(e, SessionEvent::MetadataReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(metadata.name, "second.bin");

    // 4. The single download of the second file is still available
    receiver.handle.request_download(None).await.unwrap();
    let SessionEvent::FileReceived(file) = receiver
        .wait_for("second file", |e| matches!(e, SessionEvent::FileReceived(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(&file.data[..], &second[..]);

    let events = sender
        .collect_until("completion", |e| {
            matches!(e, SessionEvent::TransferCompleted { .. })
        })
        .await;
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::TransferCompleted { .. }))
            .count(),
        1
    );
    assert!(matches!(
        events.last(),
        Some(SessionEvent::TransferCompleted { downloads: 1, .. })
    ));
}
