mod common;

use common::{Network, init_tracing, sample_bytes, wait_snapshot};
use peerdrop_core::{
    AccessPolicy, RequestRejection, SessionEvent, SessionOptions, SharedFile, TransferStatus,
};

fn is_file(e: &SessionEvent) -> bool {
    matches!(e, SessionEvent::FileReceived(_))
}

fn is_rejection(e: &SessionEvent) -> bool {
    matches!(e, SessionEvent::DownloadRejected(_))
}

#[tokio::test]
async fn test_download_limit_one_scenario() {
    init_tracing();
    let net = Network::new();
    let data = sample_bytes(100_000);

    // 1. Share a 100,000 byte file with a limit of one download
    let (mut sender, session_id) = net
        .sender(
            SharedFile::from_bytes("report.pdf", data.clone()),
            AccessPolicy::with_limit(1),
            SessionOptions::default(),
        )
        .await;

    // 2. First receiver gets the whole file
    let (mut first, _) = net.receiver(&session_id, SessionOptions::default()).await;
    first.handle.request_download(None).await.unwrap();
    let received = first.collect_until("file", is_file).await;
    let Some(SessionEvent::FileReceived(file)) = received.last() else {
        unreachable!()
    };
    assert_eq!(&file.data[..], &data[..]);
    wait_snapshot(&first.handle, "first at 100%", |s| {
        s.peers.first().is_some_and(|p| p.transfer.progress_percent == 100)
    })
    .await;

    sender
        .wait_for("completion", |e| {
            matches!(e, SessionEvent::TransferCompleted { downloads: 1, .. })
        })
        .await;
    let frames_after_first = net.connector.binary_frames();

    // 3. A second receiver is refused without a single chunk
    let (mut second, _) = net.receiver(&session_id, SessionOptions::default()).await;
    second.handle.request_download(None).await.unwrap();
    let rejection = second.wait_for("rejection", is_rejection).await;
    assert!(matches!(
        rejection,
        SessionEvent::DownloadRejected(RequestRejection::DownloadLimitReached)
    ));
    wait_snapshot(&second.handle, "limit reached state", |s| {
        s.peers
            .first()
            .is_some_and(|p| p.transfer.status == TransferStatus::LimitReached)
    })
    .await;

    // 4. A retry from the first receiver is refused too
    first.handle.request_download(None).await.unwrap();
    let rejection = first.wait_for("rejection", is_rejection).await;
    assert!(matches!(
        rejection,
        SessionEvent::DownloadRejected(RequestRejection::DownloadLimitReached)
    ));

    assert_eq!(net.connector.binary_frames(), frames_after_first);
    let snapshot = wait_snapshot(&sender.handle, "sender snapshot", |_| true).await;
    assert_eq!(snapshot.downloads, 1);
}

#[tokio::test]
async fn test_limit_plus_one_request_gets_no_chunks() {
    init_tracing();
    let net = Network::new();
    let limit = 3;
    let (mut sender, session_id) = net
        .sender(
            SharedFile::from_bytes("small.txt", sample_bytes(40_000)),
            AccessPolicy::with_limit(limit),
            SessionOptions::default(),
        )
        .await;

    for n in 1..=limit {
        let (mut receiver, _) = net.receiver(&session_id, SessionOptions::default()).await;
        receiver.handle.request_download(None).await.unwrap();
        receiver.wait_for("file", is_file).await;
        sender
            .wait_for("completion", |e| {
                matches!(e, SessionEvent::TransferCompleted { downloads, .. } if *downloads == n)
            })
            .await;
    }

    let frames = net.connector.binary_frames();
    let (mut extra, _) = net.receiver(&session_id, SessionOptions::default()).await;
    extra.handle.request_download(None).await.unwrap();
    assert!(matches!(
        extra.wait_for("rejection", is_rejection).await,
        SessionEvent::DownloadRejected(RequestRejection::DownloadLimitReached)
    ));
    assert_eq!(net.connector.binary_frames(), frames);
    let snapshot = wait_snapshot(&sender.handle, "download count", |s| s.downloads == limit).await;
    assert_eq!(snapshot.downloads, limit);
}

#[tokio::test]
async fn test_wrong_password_then_correct_one() {
    init_tracing();
    let net = Network::new();
    let data = sample_bytes(50_000);
    let (_sender, session_id) = net
        .sender(
            SharedFile::from_bytes("secret.zip", data.clone()),
            AccessPolicy::with_limit(1).with_password("abc"),
            SessionOptions::default(),
        )
        .await;

    let (mut receiver, metadata) = net.receiver(&session_id, SessionOptions::default()).await;
    assert!(metadata.is_password_protected);

    // 1. "xyz" is refused and no bytes flow
    receiver
        .handle
        .request_download(Some("xyz".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        receiver.wait_for("rejection", is_rejection).await,
        SessionEvent::DownloadRejected(RequestRejection::PasswordIncorrect)
    ));
    assert_eq!(net.connector.binary_frames(), 0);

    // 2. Link stays up, "abc" goes through
    wait_snapshot(&receiver.handle, "ready link", |s| {
        s.peers.first().is_some_and(|p| p.is_ready)
    })
    .await;
    receiver
        .handle
        .request_download(Some("abc".to_string()))
        .await
        .unwrap();
    let received = receiver.collect_until("file", is_file).await;
    let Some(SessionEvent::FileReceived(file)) = received.last() else {
        unreachable!()
    };
    assert_eq!(&file.data[..], &data[..]);
}

#[tokio::test]
async fn test_password_never_matches_other_values() {
    init_tracing();
    let net = Network::new();
    let (_sender, session_id) = net
        .sender(
            SharedFile::from_bytes("secret.txt", sample_bytes(20_000)),
            AccessPolicy::with_limit(5).with_password("secret"),
            SessionOptions::default(),
        )
        .await;
    let (mut receiver, _) = net.receiver(&session_id, SessionOptions::default()).await;

    for attempt in [None, Some(""), Some("Secret"), Some("secret "), Some("secre")] {
        receiver
            .handle
            .request_download(attempt.map(str::to_string))
            .await
            .unwrap();
        assert!(
            matches!(
                receiver.wait_for("rejection", is_rejection).await,
                SessionEvent::DownloadRejected(RequestRejection::PasswordIncorrect)
            ),
            "attempt {:?}",
            attempt
        );
    }
    assert_eq!(net.connector.binary_frames(), 0);

    receiver
        .handle
        .request_download(Some("secret".to_string()))
        .await
        .unwrap();
    receiver.wait_for("file", is_file).await;
    assert!(net.connector.binary_frames() > 0);
}

#[tokio::test]
async fn test_zero_limit_refuses_everyone() {
    init_tracing();
    let net = Network::new();
    let (_sender, session_id) = net
        .sender(
            SharedFile::from_bytes("nothing.txt", sample_bytes(10)),
            AccessPolicy::with_limit(0),
            SessionOptions::default(),
        )
        .await;
    let (mut receiver, _) = net.receiver(&session_id, SessionOptions::default()).await;
    receiver.handle.request_download(None).await.unwrap();
    assert!(matches!(
        receiver.wait_for("rejection", is_rejection).await,
        SessionEvent::DownloadRejected(RequestRejection::DownloadLimitReached)
    ));
}

#[tokio::test]
async fn test_refusal_overrides_empty_file_completion() {
    init_tracing();
    let net = Network::new();
    let (mut sender, session_id) = net
        .sender(
            SharedFile::from_bytes("empty.txt", Vec::new()),
            AccessPolicy::with_limit(1).with_password("abc"),
            SessionOptions::default(),
        )
        .await;
    let (mut receiver, _) = net.receiver(&session_id, SessionOptions::default()).await;

    // 1. An empty file completes on request, the refusal then overrides it
    receiver
        .handle
        .request_download(Some("xyz".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        receiver.wait_for("rejection", is_rejection).await,
        SessionEvent::DownloadRejected(RequestRejection::PasswordIncorrect)
    ));
    wait_snapshot(&receiver.handle, "refused state", |s| {
        s.peers
            .first()
            .is_some_and(|p| p.transfer.status == TransferStatus::AwaitingRequest && p.is_ready)
    })
    .await;
    let snapshot = wait_snapshot(&sender.handle, "sender snapshot", |_| true).await;
    assert_eq!(snapshot.downloads, 0);

    // 2. The right password is counted once
    receiver
        .handle
        .request_download(Some("abc".to_string()))
        .await
        .unwrap();
    receiver.wait_for("file", is_file).await;
    sender
        .wait_for("completion", |e| {
            matches!(e, SessionEvent::TransferCompleted { downloads: 1, .. })
        })
        .await;
}
