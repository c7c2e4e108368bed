//! Races between joins, leaves, publishes and packet forwarding

use futures::future::join_all;
use minisfu_sfu::test_helpers::{published_track, test_packet, test_sfu, track_info};
use minisfu_sfu::{PacketSink, Peer, PeerId, Router, SessionId, TrackId, TrackKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribe_stops_delivery_under_load() {
    let (upstream, _feedback) = mpsc::unbounded_channel();
    let router = Arc::new(Router::new(
        track_info("publisher", "cam", TrackKind::Video),
        upstream,
        0,
    ));
    let stop = Arc::new(AtomicBool::new(false));

    let forwarder = {
        let router = Arc::clone(&router);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut seq = 0u16;
            while !stop.load(Ordering::Relaxed) {
                router.forward(&test_packet(seq));
                seq = seq.wrapping_add(1);
                if seq % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let churners: Vec<_> = (0..8)
        .map(|n| {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                let peer_id = PeerId::new(format!("sub-{n}"));
                for _ in 0..200 {
                    let sink = Arc::new(PacketSink::new(32));
                    router.subscribe(peer_id.clone(), Arc::clone(&sink)).unwrap();
                    tokio::task::yield_now().await;
                    router.unsubscribe(&peer_id).unwrap();

                    // Nothing is accepted once unsubscribe has returned
                    let accepted = sink.pushed();
                    assert!(sink.is_closed());
                    tokio::task::yield_now().await;
                    assert_eq!(sink.pushed(), accepted);
                }
            })
        })
        .collect();

    for result in join_all(churners).await {
        result.unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    forwarder.await.unwrap();
    assert_eq!(router.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_racing_joins_subscribes_each_peer_once() {
    let (sfu, _factory) = test_sfu();
    let session = sfu.get_or_create_session(&SessionId::from("room")).unwrap();
    session
        .add_peer(Peer::with_id(Arc::clone(&sfu), PeerId::from("publisher")))
        .unwrap();

    let joins: Vec<_> = (0..16)
        .map(|n| {
            let sfu = Arc::clone(&sfu);
            tokio::spawn(async move {
                let peer = Peer::with_id(sfu, PeerId::new(format!("viewer-{n}")));
                peer.join(SessionId::from("room")).await.unwrap();
                peer
            })
        })
        .collect();

    let (track, _packets, _upstream) = published_track("publisher", "cam", TrackKind::Video);
    let router = session.publish_track(track).unwrap();

    let viewers: Vec<Arc<Peer>> = join_all(joins)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let subscribers = router.subscriber_ids();
    assert_eq!(subscribers.len(), viewers.len());
    for viewer in &viewers {
        assert!(router.has_subscriber(viewer.id()));
    }
    assert!(!router.has_subscriber(&PeerId::from("publisher")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_and_leave_churn_keeps_registry_consistent() {
    let (sfu, _factory) = test_sfu();

    let tasks: Vec<_> = (0..32)
        .map(|n| {
            let sfu = Arc::clone(&sfu);
            tokio::spawn(async move {
                let peer = Peer::new(sfu);
                peer.join(SessionId::new(format!("room-{}", n % 4)))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
                peer.close().await;
            })
        })
        .collect();
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(sfu.session_count(), 0);
    assert_eq!(sfu.cleanup_empty_sessions(), 0);
}

#[tokio::test]
async fn test_unpublish_closes_subscriber_sinks() {
    let (sfu, _factory) = test_sfu();
    let session = sfu.get_or_create_session(&SessionId::from("room")).unwrap();
    for name in ["publisher", "viewer"] {
        session
            .add_peer(Peer::with_id(Arc::clone(&sfu), PeerId::from(name)))
            .unwrap();
    }
    let (track, _packets, _upstream) = published_track("publisher", "mic", TrackKind::Audio);
    let router = session.publish_track(track).unwrap();
    assert_eq!(router.forward(&test_packet(1)), 1);

    assert!(session.unpublish_track(&TrackId::from("mic")));
    assert!(!session.unpublish_track(&TrackId::from("mic")));
    assert_eq!(router.forward(&test_packet(2)), 0);
    assert!(router.is_closed());
}
