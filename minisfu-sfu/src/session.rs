//! SFU Session management
//!
//! A [`Session`] is a named group of peers. It owns one [`Router`] per
//! published track and keeps every peer subscribed to every track published
//! by someone else.
//!
//! All membership and routing changes happen under the session lock, and
//! the resulting per-peer work is queued to the peers while that lock is
//! still held, so every peer sees changes in the order the session applied
//! them. Lock order is session, then router; a peer's own state lock is
//! never taken here.

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::{Peer, PeerCommand};
use crate::router::Router;
use crate::sink::PacketSink;
use crate::track::TrackKind;
use crate::transport::PublishedTrack;
use crate::types::{PeerId, SessionId, TrackId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Default)]
struct SessionInner {
    peers: HashMap<PeerId, Arc<Peer>>,
    routers: HashMap<TrackId, Arc<Router>>,
    /// Set once the registry reaps the session; no peer may join afterwards
    closed: bool,
}

/// Session statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub peer_count: usize,
    pub audio_tracks: usize,
    pub video_tracks: usize,
    pub total_peers_joined: u64,
    pub messages_broadcast: u64,
    pub packets_relayed: u64,
    pub bytes_relayed: u64,
    pub packets_dropped: u64,
}

pub struct Session {
    id: SessionId,
    config: Arc<SfuConfig>,
    inner: Mutex<SessionInner>,
    this: Weak<Session>,
    total_peers_joined: AtomicU64,
    messages_broadcast: AtomicU64,
    created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, config: Arc<SfuConfig>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            config,
            inner: Mutex::new(SessionInner::default()),
            this: this.clone(),
            total_peers_joined: AtomicU64::new(0),
            messages_broadcast: AtomicU64::new(0),
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add `peer` and subscribe it to every existing track. The peer is
    /// asked for one offer covering all of them.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SfuError::Closed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(SfuError::InvalidState(format!(
                "peer {} is already in session {}",
                peer.id(),
                self.id
            )));
        }
        let max_peers = self.config.max_peers_per_session;
        if max_peers > 0 && inner.peers.len() >= max_peers {
            warn!(
                session_id = %self.id,
                max_peers,
                "Session peer limit reached"
            );
            return Err(SfuError::ResourceExhausted(format!(
                "session {} is full ({max_peers} peers)",
                self.id
            )));
        }

        peer.set_session(self.this.clone());
        for router in inner.routers.values() {
            self.subscribe(router, &peer);
        }
        peer.enqueue(PeerCommand::Negotiate);

        inner.peers.insert(peer.id().clone(), Arc::clone(&peer));
        self.total_peers_joined.fetch_add(1, Ordering::Relaxed);

        info!(
            session_id = %self.id,
            peer_id = %peer.id(),
            peer_count = inner.peers.len(),
            tracks = inner.routers.len(),
            "Peer added to session"
        );
        Ok(())
    }

    fn subscribe(&self, router: &Router, peer: &Peer) {
        let sink = Arc::new(PacketSink::new(self.config.sink_capacity));
        match router.subscribe(peer.id().clone(), Arc::clone(&sink)) {
            Ok(feedback) => peer.enqueue(PeerCommand::AddTrack {
                track: router.track().clone(),
                sink,
                feedback,
            }),
            Err(e) => warn!(
                session_id = %self.id,
                peer_id = %peer.id(),
                track_id = %router.track_id(),
                error = %e,
                "Subscription refused"
            ),
        }
    }

    /// Remove a peer, its subscriptions and every track it published.
    /// Returns `false` if the peer was not a member.
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.peers.remove(peer_id).is_none() {
            return false;
        }

        for router in inner.routers.values() {
            router.unsubscribe(peer_id);
        }

        let published: Vec<TrackId> = inner
            .routers
            .values()
            .filter(|router| router.publisher() == peer_id)
            .map(|router| router.track_id().clone())
            .collect();
        for track_id in &published {
            if let Some(router) = inner.routers.remove(track_id) {
                Self::teardown(&inner, &router);
            }
        }

        info!(
            session_id = %self.id,
            peer_id = %peer_id,
            removed_tracks = published.len(),
            remaining_peers = inner.peers.len(),
            "Peer removed from session"
        );
        true
    }

    /// Create a router for a newly published track and subscribe every
    /// other peer to it. The router runs until the track's packet channel
    /// closes, after which the track is unpublished.
    pub fn publish_track(&self, track: PublishedTrack) -> Result<Arc<Router>> {
        let PublishedTrack {
            info,
            packets,
            feedback,
        } = track;

        let router = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SfuError::Closed);
            }
            if !inner.peers.contains_key(&info.publisher) {
                return Err(SfuError::NotFound(format!(
                    "publisher {} is not in session {}",
                    info.publisher, self.id
                )));
            }
            if inner.routers.contains_key(&info.id) {
                return Err(SfuError::InvalidState(format!(
                    "track {} is already published",
                    info.id
                )));
            }

            let router = Arc::new(Router::new(
                info,
                feedback,
                self.config.max_subscribers_per_track,
            ));
            for (peer_id, peer) in &inner.peers {
                if peer_id != router.publisher() {
                    self.subscribe(&router, peer);
                }
            }
            inner
                .routers
                .insert(router.track_id().clone(), Arc::clone(&router));

            info!(
                session_id = %self.id,
                track_id = %router.track_id(),
                publisher = %router.publisher(),
                subscribers = router.subscriber_count(),
                "Track published"
            );
            router
        };

        let session = self.this.clone();
        let pump = Arc::clone(&router);
        tokio::spawn(async move {
            pump.run(packets).await;
            match session.upgrade() {
                Some(session) => session.unpublish_router(&pump),
                None => {
                    pump.close();
                }
            }
        });

        Ok(router)
    }

    /// Remove the router of `track_id`, renegotiating its subscribers.
    /// Returns `false` if no such track is published.
    pub fn unpublish_track(&self, track_id: &TrackId) -> bool {
        let mut inner = self.inner.lock();
        let Some(router) = inner.routers.remove(track_id) else {
            return false;
        };
        Self::teardown(&inner, &router);
        info!(session_id = %self.id, track_id = %track_id, "Track unpublished");
        true
    }

    /// Unpublish `router` only if it is still the one registered for its
    /// track; a republished track with the same id is left alone.
    fn unpublish_router(&self, router: &Arc<Router>) {
        let mut inner = self.inner.lock();
        let current = inner
            .routers
            .get(router.track_id())
            .is_some_and(|current| Arc::ptr_eq(current, router));
        if current {
            inner.routers.remove(router.track_id());
            Self::teardown(&inner, router);
            info!(session_id = %self.id, track_id = %router.track_id(), "Track ended");
        } else {
            router.close();
        }
    }

    /// Renegotiate the router's subscribers, then release its sinks
    fn teardown(inner: &SessionInner, router: &Router) {
        for subscriber in router.subscriber_ids() {
            if let Some(peer) = inner.peers.get(&subscriber) {
                peer.enqueue(PeerCommand::RemoveTrack {
                    track_id: router.track_id().clone(),
                });
            }
        }
        router.close();
    }

    /// Relay `payload` to every peer except `from`. Returns the number of
    /// peers it was queued for.
    pub fn broadcast(&self, from: &PeerId, payload: Bytes) -> usize {
        let inner = self.inner.lock();
        let mut delivered = 0;
        for (peer_id, peer) in &inner.peers {
            if peer_id != from {
                peer.enqueue(PeerCommand::SendData {
                    payload: payload.clone(),
                });
                delivered += 1;
            }
        }
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %self.id, from = %from, delivered, "Broadcast data message");
        delivered
    }

    /// Mark the session closed if it has no peers. Once closed, `add_peer`
    /// fails with [`SfuError::Closed`].
    pub(crate) fn close_if_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.peers.is_empty() {
            return false;
        }
        inner.closed = true;
        for (_, router) in inner.routers.drain() {
            router.close();
        }
        true
    }

    /// Close the session and hand back its peers so the caller can close
    /// them outside the session lock.
    pub(crate) fn close(&self) -> Vec<Arc<Peer>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, router) in inner.routers.drain() {
            router.close();
        }
        inner.peers.drain().map(|(_, peer)| peer).collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.lock().peers.get(peer_id).cloned()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.lock().peers.keys().cloned().collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().peers.is_empty()
    }

    #[must_use]
    pub fn router(&self, track_id: &TrackId) -> Option<Arc<Router>> {
        self.inner.lock().routers.get(track_id).cloned()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.inner.lock().routers.keys().cloned().collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        let mut stats = SessionStats {
            peer_count: inner.peers.len(),
            total_peers_joined: self.total_peers_joined.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            ..Default::default()
        };
        for router in inner.routers.values() {
            match router.track().kind {
                TrackKind::Audio => stats.audio_tracks += 1,
                TrackKind::Video => stats.video_tracks += 1,
            }
            let router_stats = router.stats();
            stats.packets_relayed += router_stats.packets_out;
            stats.bytes_relayed += router_stats.bytes_in;
            stats.packets_dropped += router_stats.packets_dropped;
        }
        stats
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session_id = %self.id, "Session dropped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{published_track, test_sfu};
    use crate::track::{MediaPacket, TrackKind};

    #[tokio::test]
    async fn test_peer_limit() {
        let (sfu, _factory) = test_sfu();
        let config = SfuConfig {
            max_peers_per_session: 1,
            ..SfuConfig::default()
        };
        let session = Session::new(SessionId::from("room"), Arc::new(config));

        session.add_peer(Peer::new(Arc::clone(&sfu))).unwrap();
        let err = session.add_peer(Peer::new(sfu)).unwrap_err();
        assert!(matches!(err, SfuError::ResourceExhausted(_)));
        assert_eq!(session.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_peer_is_rejected() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        let peer = Peer::new(sfu);
        session.add_peer(Arc::clone(&peer)).unwrap();
        assert!(matches!(
            session.add_peer(peer).unwrap_err(),
            SfuError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_subscribes_everyone_but_publisher() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        let alice = Peer::with_id(Arc::clone(&sfu), PeerId::from("alice"));
        let bob = Peer::with_id(Arc::clone(&sfu), PeerId::from("bob"));
        let carol = Peer::with_id(sfu, PeerId::from("carol"));
        for peer in [&alice, &bob, &carol] {
            session.add_peer(Arc::clone(peer)).unwrap();
        }

        let (track, _packets, _upstream) = published_track("alice", "cam", TrackKind::Video);
        let router = session.publish_track(track).unwrap();

        let mut subscribers = router.subscriber_ids();
        subscribers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(subscribers, vec![PeerId::from("bob"), PeerId::from("carol")]);
        assert_eq!(session.get_stats().video_tracks, 1);
    }

    #[tokio::test]
    async fn test_publish_requires_member_and_unique_track() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        let (stranger, _p, _u) = published_track("mallory", "cam", TrackKind::Video);
        assert!(matches!(
            session.publish_track(stranger).unwrap_err(),
            SfuError::NotFound(_)
        ));

        session
            .add_peer(Peer::with_id(sfu, PeerId::from("alice")))
            .unwrap();
        let (first, _p1, _u1) = published_track("alice", "cam", TrackKind::Video);
        let (second, _p2, _u2) = published_track("alice", "cam", TrackKind::Video);
        session.publish_track(first).unwrap();
        assert!(matches!(
            session.publish_track(second).unwrap_err(),
            SfuError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_publisher_tears_down_its_routers() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        session
            .add_peer(Peer::with_id(Arc::clone(&sfu), PeerId::from("alice")))
            .unwrap();
        session
            .add_peer(Peer::with_id(sfu, PeerId::from("bob")))
            .unwrap();

        let (track, _packets, _upstream) = published_track("alice", "mic", TrackKind::Audio);
        let router = session.publish_track(track).unwrap();

        assert!(session.remove_peer(&PeerId::from("alice")));
        assert!(!session.remove_peer(&PeerId::from("alice")));
        assert!(router.is_closed());
        assert!(session.router(&TrackId::from("mic")).is_none());
        assert_eq!(session.peer_ids(), vec![PeerId::from("bob")]);
    }

    #[tokio::test]
    async fn test_track_end_unpublishes() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        session
            .add_peer(Peer::with_id(sfu, PeerId::from("alice")))
            .unwrap();

        let (track, packets, _upstream) = published_track("alice", "cam", TrackKind::Video);
        let router = session.publish_track(track).unwrap();
        packets
            .send(MediaPacket::new(Bytes::from_static(b"rtp"), 1, 1, 0))
            .await
            .unwrap();
        drop(packets);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while session.router(&TrackId::from("cam")).is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(router.is_closed());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_peers() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        assert!(session.close_if_empty());
        assert!(session.is_closed());
        assert_eq!(session.add_peer(Peer::new(sfu)).unwrap_err(), SfuError::Closed);
    }

    #[tokio::test]
    async fn test_close_if_empty_keeps_populated_session() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        session.add_peer(Peer::new(sfu)).unwrap();
        assert!(!session.close_if_empty());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let (sfu, _factory) = test_sfu();
        let session = Session::new(SessionId::from("room"), Arc::default());
        for name in ["a", "b", "c"] {
            session
                .add_peer(Peer::with_id(Arc::clone(&sfu), PeerId::from(name)))
                .unwrap();
        }
        assert_eq!(session.broadcast(&PeerId::from("a"), Bytes::from_static(b"hi")), 2);
        assert_eq!(session.get_stats().messages_broadcast, 1);
    }
}
