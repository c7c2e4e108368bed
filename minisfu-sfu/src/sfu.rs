//! SFU registry - top-level orchestration of sessions
//!
//! This module provides:
//! - Session lookup and lazy creation, safe under concurrent joins
//! - Resource limit enforcement
//! - Removal of sessions once their last peer leaves
//! - A periodic sweep and statistics collection as background tasks

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::Peer;
use crate::session::Session;
use crate::transport::TransportFactory;
use crate::types::SessionId;
use crate::webrtc_transport::WebRtcTransportFactory;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts to attach to a session that is being reaped concurrently
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// Global SFU statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SfuStats {
    /// Number of active sessions
    pub active_sessions: usize,
    /// Total number of peers across all sessions
    pub total_peers: usize,
    /// Total number of audio tracks
    pub total_audio_tracks: usize,
    /// Total number of video tracks
    pub total_video_tracks: usize,
    /// Total packets delivered to subscribers
    pub total_packets_relayed: u64,
    /// Total bytes received from publishers
    pub total_bytes_relayed: u64,
    /// Total packets dropped by slow subscribers
    pub total_packets_dropped: u64,
}

/// The SFU - registry of sessions keyed by id
pub struct Sfu {
    config: Arc<SfuConfig>,

    /// Active sessions
    sessions: DashMap<SessionId, Arc<Session>>,

    /// Builds the transport legs of joining peers
    factory: Arc<dyn TransportFactory>,

    /// Last collected statistics
    stats: RwLock<SfuStats>,

    /// Stops the background tasks
    shutdown: CancellationToken,
}

impl Sfu {
    /// Create an SFU whose peers use `factory` for their transports
    pub fn new(config: SfuConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let sfu = Arc::new(Self {
            config: Arc::new(config),
            sessions: DashMap::new(),
            factory,
            stats: RwLock::new(SfuStats::default()),
            shutdown: CancellationToken::new(),
        });

        info!(
            max_sessions = sfu.config.max_sessions,
            max_peers_per_session = sfu.config.max_peers_per_session,
            max_subscribers_per_track = sfu.config.max_subscribers_per_track,
            "SFU initialized"
        );
        sfu
    }

    /// Create an SFU backed by webrtc-rs transports
    pub fn with_webrtc(config: SfuConfig) -> Result<Arc<Self>> {
        let factory = WebRtcTransportFactory::new(&config)?;
        Ok(Self::new(config, Arc::new(factory)))
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.factory
    }

    /// Get or create a session. Concurrent callers with the same id all get
    /// the same session.
    pub fn get_or_create_session(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(Arc::clone(session.value()));
        }

        // Enforce session limit (0 = unlimited)
        let max_sessions = self.config.max_sessions;
        if max_sessions > 0 && self.sessions.len() >= max_sessions {
            warn!(
                current_sessions = self.sessions.len(),
                max_sessions, "Session limit reached"
            );
            return Err(SfuError::ResourceExhausted(format!(
                "maximum number of sessions ({max_sessions}) reached"
            )));
        }

        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                info!(session_id = %session_id, "Created new session");
                Session::new(session_id.clone(), Arc::clone(&self.config))
            });
        Ok(Arc::clone(session.value()))
    }

    /// Look up an existing session
    pub fn get_session(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|session| Arc::clone(session.value()))
            .ok_or_else(|| SfuError::NotFound(format!("session {session_id} not found")))
    }

    /// Add `peer` to `session_id`, creating the session if needed. Retries
    /// when the session found was reaped before the peer could be added.
    pub(crate) fn attach(&self, session_id: &SessionId, peer: Arc<Peer>) -> Result<Arc<Session>> {
        for _ in 0..MAX_ATTACH_ATTEMPTS {
            let session = self.get_or_create_session(session_id)?;
            match session.add_peer(Arc::clone(&peer)) {
                Ok(()) => return Ok(session),
                Err(SfuError::Closed) => {
                    debug!(session_id = %session_id, "Session closed during join, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(SfuError::Closed)
    }

    /// Remove the session if it has no peers left. The check and the
    /// removal are atomic with respect to joins.
    pub fn reap_if_empty(&self, session_id: &SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.close_if_empty())
            .is_some();
        if removed {
            info!(
                session_id = %session_id,
                remaining_sessions = self.sessions.len(),
                "Removed empty session"
            );
        }
        removed
    }

    /// Remove every empty session. Returns how many were removed.
    pub fn cleanup_empty_sessions(&self) -> usize {
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let removed_count = candidates
            .iter()
            .filter(|session_id| self.reap_if_empty(session_id))
            .count();

        if removed_count > 0 {
            info!(
                removed_count,
                remaining_sessions = self.sessions.len(),
                "Cleaned up empty sessions"
            );
        }
        removed_count
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Aggregate statistics over every live session
    #[must_use]
    pub fn collect_stats(&self) -> SfuStats {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut stats = SfuStats {
            active_sessions: sessions.len(),
            ..Default::default()
        };
        for session in sessions {
            let session_stats = session.get_stats();
            stats.total_peers += session_stats.peer_count;
            stats.total_audio_tracks += session_stats.audio_tracks;
            stats.total_video_tracks += session_stats.video_tracks;
            stats.total_packets_relayed += session_stats.packets_relayed;
            stats.total_bytes_relayed += session_stats.bytes_relayed;
            stats.total_packets_dropped += session_stats.packets_dropped;
        }
        stats
    }

    /// Statistics as of the last collection tick
    #[must_use]
    pub fn get_stats(&self) -> SfuStats {
        self.stats.read().clone()
    }

    /// Start the cleanup and statistics tasks. They hold only a weak
    /// reference and stop on [`Sfu::shutdown`] or when the SFU is dropped.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        if self.config.cleanup_interval_secs > 0 {
            let period = Duration::from_secs(self.config.cleanup_interval_secs);
            handles.push(tokio::spawn(Self::cleanup_task(
                Arc::downgrade(self),
                self.shutdown.clone(),
                period,
            )));
        }
        handles.push(tokio::spawn(Self::stats_collection_task(
            Arc::downgrade(self),
            self.shutdown.clone(),
        )));
        handles
    }

    /// Background task for periodic cleanup
    async fn cleanup_task(sfu: Weak<Self>, shutdown: CancellationToken, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Starting cleanup task");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(sfu) = sfu.upgrade() else { break };
                    sfu.cleanup_empty_sessions();
                }
            }
        }
        debug!("Cleanup task stopped");
    }

    /// Background task for statistics collection
    async fn stats_collection_task(sfu: Weak<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(5));
        info!("Starting statistics collection task (interval: 5s)");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(sfu) = sfu.upgrade() else { break };
                    let stats = sfu.collect_stats();
                    debug!(
                        active_sessions = stats.active_sessions,
                        total_peers = stats.total_peers,
                        total_packets_relayed = stats.total_packets_relayed,
                        "Updated global statistics"
                    );
                    *sfu.stats.write() = stats;
                }
            }
        }
        debug!("Statistics collection task stopped");
    }

    /// Close every session and peer and stop the background tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let session_ids = self.session_ids();
        let mut closed_peers = 0;
        for session_id in session_ids {
            let Some((_, session)) = self.sessions.remove(&session_id) else {
                continue;
            };
            for peer in session.close() {
                peer.close().await;
                closed_peers += 1;
            }
        }
        info!(closed_peers, "SFU shut down");
    }
}

impl std::fmt::Debug for Sfu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sfu")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_sfu, test_sfu_with};

    #[tokio::test]
    async fn test_sfu_creation() {
        let (sfu, _factory) = test_sfu();
        assert_eq!(sfu.session_count(), 0);
        assert_eq!(sfu.get_stats(), SfuStats::default());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (sfu, _factory) = test_sfu();
        let session_id = SessionId::from("test-session");

        let session = sfu.get_or_create_session(&session_id).unwrap();
        assert_eq!(sfu.session_count(), 1);

        // Getting the same session should return the existing one
        let session2 = sfu.get_or_create_session(&session_id).unwrap();
        assert_eq!(sfu.session_count(), 1);
        assert!(Arc::ptr_eq(&session, &session2));
        assert!(Arc::ptr_eq(&session, &sfu.get_session(&session_id).unwrap()));
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let (sfu, _factory) = test_sfu();
        let err = sfu.get_session(&SessionId::from("nope")).unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (sfu, _factory) = test_sfu_with(SfuConfig {
            max_sessions: 2,
            ..SfuConfig::default()
        });

        sfu.get_or_create_session(&SessionId::from("s1")).unwrap();
        sfu.get_or_create_session(&SessionId::from("s2")).unwrap();

        let result = sfu.get_or_create_session(&SessionId::from("s3"));
        assert!(matches!(result, Err(SfuError::ResourceExhausted(_))));
        // Existing sessions are still reachable at the limit
        assert!(sfu.get_or_create_session(&SessionId::from("s1")).is_ok());
    }

    #[tokio::test]
    async fn test_reap_only_empty_sessions() {
        let (sfu, _factory) = test_sfu();
        let empty = SessionId::from("empty");
        let busy = SessionId::from("busy");
        let session = sfu.get_or_create_session(&empty).unwrap();
        sfu.get_or_create_session(&busy)
            .unwrap()
            .add_peer(Peer::new(Arc::clone(&sfu)))
            .unwrap();

        assert!(!sfu.reap_if_empty(&busy));
        assert!(sfu.reap_if_empty(&empty));
        assert!(session.is_closed());
        assert!(!sfu.reap_if_empty(&empty));
        assert_eq!(sfu.session_ids(), vec![busy]);
    }

    #[tokio::test]
    async fn test_cleanup_empty_sessions() {
        let (sfu, _factory) = test_sfu();
        for name in ["a", "b", "c"] {
            sfu.get_or_create_session(&SessionId::from(name)).unwrap();
        }
        sfu.get_session(&SessionId::from("b"))
            .unwrap()
            .add_peer(Peer::new(Arc::clone(&sfu)))
            .unwrap();

        assert_eq!(sfu.cleanup_empty_sessions(), 2);
        assert_eq!(sfu.session_ids(), vec![SessionId::from("b")]);
    }

    #[tokio::test]
    async fn test_attach_retries_after_reap() {
        let (sfu, _factory) = test_sfu();
        let session_id = SessionId::from("room");
        let stale = sfu.get_or_create_session(&session_id).unwrap();
        assert!(sfu.reap_if_empty(&session_id));

        let session = sfu.attach(&session_id, Peer::new(Arc::clone(&sfu))).unwrap();
        assert!(!Arc::ptr_eq(&stale, &session));
        assert_eq!(session.peer_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_session() {
        let (sfu, _factory) = test_sfu();
        let session_id = SessionId::from("race");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sfu = Arc::clone(&sfu);
                let session_id = session_id.clone();
                tokio::spawn(async move { sfu.get_or_create_session(&session_id).unwrap() })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(sfu.session_count(), 1);
    }

    #[tokio::test]
    async fn test_stats_collection() {
        let (sfu, _factory) = test_sfu();
        sfu.get_or_create_session(&SessionId::from("s"))
            .unwrap()
            .add_peer(Peer::new(Arc::clone(&sfu)))
            .unwrap();

        let stats = sfu.collect_stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_peers, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (sfu, _factory) = test_sfu();
        let handles = sfu.spawn_background_tasks();
        let peer = Peer::new(Arc::clone(&sfu));
        peer.join(SessionId::from("room")).await.unwrap();

        sfu.shutdown().await;
        assert!(peer.is_closed());
        assert_eq!(sfu.session_count(), 0);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
