//! Per-track fan-out
//!
//! A [`Router`] owns delivery of one publisher track. The subscriber set is
//! kept as a copy-on-write snapshot: `forward` clones the current
//! `Arc<HashMap>` under a short read lock and pushes into every sink with no
//! router lock held, while `subscribe`/`unsubscribe` swap in a new map.
//!
//! RTCP feedback from subscribers travels the other way through
//! [`FeedbackSender`]s, which write into the publisher's upstream channel.

use crate::error::{Result, SfuError};
use crate::sink::{PacketSink, PushOutcome};
use crate::track::{Feedback, MediaPacket, TrackInfo};
use crate::types::{PeerId, TrackId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

type SubscriberMap = HashMap<PeerId, Arc<PacketSink>>;

/// Counters shared by a router and the feedback senders it hands out
#[derive(Debug, Default)]
struct RouterCounters {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    packets_dropped: AtomicU64,
    feedback_relayed: AtomicU64,
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub subscribers: usize,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_dropped: u64,
    pub feedback_relayed: u64,
}

#[derive(Debug)]
pub struct Router {
    track: TrackInfo,
    max_subscribers: usize,
    subscribers: RwLock<Arc<SubscriberMap>>,
    upstream: mpsc::UnboundedSender<Feedback>,
    closed: Arc<AtomicBool>,
    counters: Arc<RouterCounters>,
}

impl Router {
    /// Create a router for `track`. Feedback from subscribers is written to
    /// `upstream`, which the publisher's transport drains.
    #[must_use]
    pub fn new(
        track: TrackInfo,
        upstream: mpsc::UnboundedSender<Feedback>,
        max_subscribers: usize,
    ) -> Self {
        info!(
            track_id = %track.id,
            publisher = %track.publisher,
            kind = track.kind.as_str(),
            "Creating router"
        );
        Self {
            track,
            max_subscribers,
            subscribers: RwLock::new(Arc::new(HashMap::new())),
            upstream,
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    #[must_use]
    pub const fn track(&self) -> &TrackInfo {
        &self.track
    }

    #[must_use]
    pub const fn track_id(&self) -> &TrackId {
        &self.track.id
    }

    #[must_use]
    pub const fn publisher(&self) -> &PeerId {
        &self.track.publisher
    }

    /// Register `sink` for `peer_id`, replacing any previous sink of that peer
    pub fn subscribe(&self, peer_id: PeerId, sink: Arc<PacketSink>) -> Result<FeedbackSender> {
        if peer_id == self.track.publisher {
            return Err(SfuError::InvalidState(format!(
                "peer {peer_id} cannot subscribe to its own track {}",
                self.track.id
            )));
        }

        let replaced = {
            let mut guard = self.subscribers.write();
            if self.closed.load(Ordering::Acquire) {
                return Err(SfuError::Closed);
            }
            if self.max_subscribers > 0
                && !guard.contains_key(&peer_id)
                && guard.len() >= self.max_subscribers
            {
                return Err(SfuError::ResourceExhausted(format!(
                    "track {} already has {} subscribers",
                    self.track.id, self.max_subscribers
                )));
            }
            let mut next = SubscriberMap::clone(&guard);
            let replaced = next.insert(peer_id.clone(), sink);
            *guard = Arc::new(next);
            replaced
        };

        if let Some(old) = replaced {
            old.close();
        }

        debug!(track_id = %self.track.id, peer_id = %peer_id, "Subscriber registered");

        Ok(FeedbackSender {
            subscriber: peer_id,
            track_id: self.track.id.clone(),
            upstream: self.upstream.clone(),
            closed: Arc::clone(&self.closed),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Remove the sink of `peer_id`. No packet reaches it once this returns.
    pub fn unsubscribe(&self, peer_id: &PeerId) -> Option<Arc<PacketSink>> {
        let removed = {
            let mut guard = self.subscribers.write();
            if !guard.contains_key(peer_id) {
                return None;
            }
            let mut next = SubscriberMap::clone(&guard);
            let removed = next.remove(peer_id);
            *guard = Arc::new(next);
            removed
        };

        if let Some(sink) = &removed {
            sink.close();
            debug!(track_id = %self.track.id, peer_id = %peer_id, "Subscriber removed");
        }
        removed
    }

    /// Copy one packet to every current subscriber. Returns how many sinks
    /// accepted it.
    pub fn forward(&self, packet: &MediaPacket) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_in
            .fetch_add(packet.len() as u64, Ordering::Relaxed);

        let snapshot: Arc<SubscriberMap> = self.subscribers.read().clone();
        let mut delivered = 0;
        for sink in snapshot.values() {
            match sink.push(packet.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::Closed => {}
            }
        }
        self.counters
            .packets_out
            .fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(track_id = %self.track.id, seq = packet.sequence_number, delivered, "Forwarded packet");
        delivered
    }

    /// Forward packets from the publisher until the source ends or the
    /// router is closed.
    pub async fn run(&self, mut source: mpsc::Receiver<MediaPacket>) {
        while let Some(packet) = source.recv().await {
            if self.is_closed() {
                break;
            }
            self.forward(&packet);
        }
        debug!(track_id = %self.track.id, "Router source ended");
    }

    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<PeerId> {
        self.subscribers.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn has_subscriber(&self, peer_id: &PeerId) -> bool {
        self.subscribers.read().contains_key(peer_id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the router down, closing every sink. Returns the peers that were
    /// subscribed.
    pub fn close(&self) -> Vec<PeerId> {
        let previous = {
            let mut guard = self.subscribers.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Vec::new();
            }
            std::mem::replace(&mut *guard, Arc::new(HashMap::new()))
        };

        for sink in previous.values() {
            sink.close();
        }

        info!(
            track_id = %self.track.id,
            subscribers = previous.len(),
            "Router closed"
        );
        previous.keys().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            subscribers: self.subscriber_count(),
            packets_in: self.counters.packets_in.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            packets_out: self.counters.packets_out.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            feedback_relayed: self.counters.feedback_relayed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        debug!(track_id = %self.track.id, "Router dropped");
    }
}

/// Handle a subscriber uses to send RTCP feedback towards the publisher
#[derive(Clone)]
pub struct FeedbackSender {
    subscriber: PeerId,
    track_id: TrackId,
    upstream: mpsc::UnboundedSender<Feedback>,
    closed: Arc<AtomicBool>,
    counters: Arc<RouterCounters>,
}

impl FeedbackSender {
    /// Relay one feedback message upstream. Returns false once the router is
    /// closed or the publisher is gone.
    pub fn send(&self, feedback: Feedback) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        trace!(
            track_id = %self.track_id,
            subscriber = %self.subscriber,
            feedback = feedback.as_str(),
            "Relaying feedback"
        );
        if self.upstream.send(feedback).is_ok() {
            self.counters.feedback_relayed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn subscriber(&self) -> &PeerId {
        &self.subscriber
    }

    #[must_use]
    pub const fn track_id(&self) -> &TrackId {
        &self.track_id
    }
}

impl std::fmt::Debug for FeedbackSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackSender")
            .field("subscriber", &self.subscriber)
            .field("track_id", &self.track_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackKind;
    use bytes::Bytes;

    fn router() -> (Router, mpsc::UnboundedReceiver<Feedback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = TrackInfo {
            id: TrackId::from("video-1"),
            stream_id: "stream-1".to_string(),
            kind: TrackKind::Video,
            mime_type: "video/VP8".to_string(),
            publisher: PeerId::from("publisher"),
        };
        (Router::new(track, tx, 0), rx)
    }

    fn packet(seq: u16) -> MediaPacket {
        MediaPacket::new(Bytes::from_static(b"payload"), 42, seq, u32::from(seq) * 90)
    }

    #[test]
    fn test_fan_out_preserves_order() {
        let (router, _rx) = router();
        let sinks: Vec<_> = (0..3)
            .map(|i| {
                let sink = Arc::new(PacketSink::new(64));
                router
                    .subscribe(PeerId::new(format!("sub-{i}")), Arc::clone(&sink))
                    .unwrap();
                sink
            })
            .collect();

        for seq in 0..20 {
            assert_eq!(router.forward(&packet(seq)), 3);
        }

        for sink in &sinks {
            let seqs: Vec<u16> = std::iter::from_fn(|| sink.try_recv())
                .map(|p| p.sequence_number)
                .collect();
            assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        }
        assert_eq!(router.stats().packets_out, 60);
    }

    #[test]
    fn test_publisher_cannot_subscribe() {
        let (router, _rx) = router();
        let err = router
            .subscribe(PeerId::from("publisher"), Arc::new(PacketSink::new(4)))
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));
    }

    #[test]
    fn test_resubscribe_replaces_sink() {
        let (router, _rx) = router();
        let first = Arc::new(PacketSink::new(4));
        let second = Arc::new(PacketSink::new(4));
        router.subscribe(PeerId::from("b"), Arc::clone(&first)).unwrap();
        router.subscribe(PeerId::from("b"), Arc::clone(&second)).unwrap();

        router.forward(&packet(1));
        assert!(first.is_closed());
        assert!(first.try_recv().is_none());
        assert_eq!(second.try_recv().unwrap().sequence_number, 1);
        assert_eq!(router.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (router, _rx) = router();
        let sink = Arc::new(PacketSink::new(4));
        router.subscribe(PeerId::from("b"), Arc::clone(&sink)).unwrap();
        router.forward(&packet(1));
        assert!(router.unsubscribe(&PeerId::from("b")).is_some());
        assert!(router.unsubscribe(&PeerId::from("b")).is_none());

        assert_eq!(router.forward(&packet(2)), 0);
        assert!(sink.try_recv().is_none());
    }

    #[test]
    fn test_overflow_is_counted_as_drop() {
        let (router, _rx) = router();
        let sink = Arc::new(PacketSink::new(2));
        router.subscribe(PeerId::from("b"), Arc::clone(&sink)).unwrap();
        for seq in 0..5 {
            router.forward(&packet(seq));
        }
        assert_eq!(router.stats().packets_dropped, 3);
        assert_eq!(sink.dropped(), 3);
        assert_eq!(sink.try_recv().unwrap().sequence_number, 3);
    }

    #[test]
    fn test_subscriber_limit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (base, _) = router();
        let router = Router::new(base.track().clone(), tx, 1);
        router.subscribe(PeerId::from("b"), Arc::new(PacketSink::new(4))).unwrap();
        let err = router
            .subscribe(PeerId::from("c"), Arc::new(PacketSink::new(4)))
            .unwrap_err();
        assert!(matches!(err, SfuError::ResourceExhausted(_)));
        // Replacing an existing subscription is still allowed
        router.subscribe(PeerId::from("b"), Arc::new(PacketSink::new(4))).unwrap();
    }

    #[test]
    fn test_feedback_forwarded_without_dedup() {
        let (router, mut rx) = router();
        let b = router.subscribe(PeerId::from("b"), Arc::new(PacketSink::new(4))).unwrap();
        let c = router.subscribe(PeerId::from("c"), Arc::new(PacketSink::new(4))).unwrap();

        assert!(b.send(Feedback::PictureLoss));
        assert!(c.send(Feedback::PictureLoss));
        assert!(b.send(Feedback::Nack { lost: vec![10, 11] }));

        assert_eq!(rx.try_recv().unwrap(), Feedback::PictureLoss);
        assert_eq!(rx.try_recv().unwrap(), Feedback::PictureLoss);
        assert_eq!(rx.try_recv().unwrap(), Feedback::Nack { lost: vec![10, 11] });
        assert_eq!(router.stats().feedback_relayed, 3);
    }

    #[test]
    fn test_close_releases_sinks_and_stops_feedback() {
        let (router, mut rx) = router();
        let sink = Arc::new(PacketSink::new(4));
        let feedback = router.subscribe(PeerId::from("b"), Arc::clone(&sink)).unwrap();

        let former = router.close();
        assert_eq!(former, vec![PeerId::from("b")]);
        assert!(sink.is_closed());
        assert_eq!(router.forward(&packet(1)), 0);
        assert!(!feedback.send(Feedback::PictureLoss));
        assert!(rx.try_recv().is_err());
        assert!(router.close().is_empty());

        let err = router
            .subscribe(PeerId::from("c"), Arc::new(PacketSink::new(4)))
            .unwrap_err();
        assert_eq!(err, SfuError::Closed);
    }

    #[tokio::test]
    async fn test_run_pumps_source() {
        let (router, _rx) = router();
        let sink = Arc::new(PacketSink::new(16));
        router.subscribe(PeerId::from("b"), Arc::clone(&sink)).unwrap();

        let (tx, source) = mpsc::channel(16);
        for seq in 0..4 {
            tx.send(packet(seq)).await.unwrap();
        }
        drop(tx);
        router.run(source).await;

        assert_eq!(sink.len(), 4);
        assert_eq!(router.stats().packets_in, 4);
    }
}
