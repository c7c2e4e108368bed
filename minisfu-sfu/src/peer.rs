//! SFU Peer management
//!
//! A [`Peer`] is one participant. It owns two transport legs:
//!
//! - the **publish** leg receives media; the participant offers, we answer
//! - the **subscribe** leg sends media; we offer, the participant answers
//!
//! Each leg runs its own signaling state machine
//! (`Stable -> HaveRemoteOffer -> Stable` on publish,
//! `Stable -> HaveLocalOffer -> Stable` on subscribe, `Closed` from anywhere).
//!
//! Work requested by the session (tracks to add or remove, data to relay) is
//! queued as [`PeerCommand`]s and applied by a per-peer worker task, which
//! also drains the events reported by the transports. Anything the
//! participant must be told is emitted as a [`SignalEvent`] after the peer's
//! lock has been released.

use crate::error::{Result, SfuError};
use crate::router::FeedbackSender;
use crate::session::Session;
use crate::sfu::Sfu;
use crate::sink::PacketSink;
use crate::track::TrackInfo;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    IceCandidate, IceConnectionState, LegKind, PeerId, SdpType, SessionDescription, SessionId,
    SignalingState, TrackId,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before a subscribe-leg offer that failed is attempted again
const OFFER_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Consecutive failed offers after which the peer waits for the next change
const MAX_OFFER_RETRIES: u32 = 5;

/// Message the signaling layer must push to the participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// Server-initiated offer for the subscribe leg
    Offer(SessionDescription),
    /// Locally gathered candidate for leg `target`
    Trickle {
        candidate: IceCandidate,
        target: LegKind,
    },
}

/// Work a session asks a peer's worker to perform
pub(crate) enum PeerCommand {
    AddTrack {
        track: TrackInfo,
        sink: Arc<PacketSink>,
        feedback: FeedbackSender,
    },
    RemoveTrack {
        track_id: TrackId,
    },
    /// Issue a subscribe-leg offer even if no track changed
    Negotiate,
    SendData {
        payload: Bytes,
    },
}

struct Leg {
    kind: LegKind,
    transport: Option<Arc<dyn Transport>>,
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice_state: IceConnectionState,
    /// Remote candidates that arrived before the remote description
    pending_candidates: VecDeque<IceCandidate>,
    /// A server-initiated offer is wanted but could not be issued yet
    negotiation_pending: bool,
    offer_failures: u32,
}

impl Leg {
    fn new(kind: LegKind) -> Self {
        Self {
            kind,
            transport: None,
            signaling: SignalingState::Stable,
            local_description: None,
            remote_description: None,
            ice_state: IceConnectionState::New,
            pending_candidates: VecDeque::new(),
            negotiation_pending: false,
            offer_failures: 0,
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport.clone().ok_or_else(|| {
            SfuError::InvalidState(format!("{} leg has no transport; join first", self.kind))
        })
    }

    fn close(&mut self) -> Option<Arc<dyn Transport>> {
        self.signaling = SignalingState::Closed;
        self.ice_state = IceConnectionState::Closed;
        self.pending_candidates.clear();
        self.negotiation_pending = false;
        self.transport.take()
    }
}

struct PeerState {
    legs: [Leg; 2],
    session_id: Option<SessionId>,
    closed: bool,
}

impl PeerState {
    fn leg(&self, kind: LegKind) -> &Leg {
        &self.legs[kind.index()]
    }

    fn leg_mut(&mut self, kind: LegKind) -> &mut Leg {
        &mut self.legs[kind.index()]
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SfuError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct PeerCounters {
    offers_sent: AtomicU64,
    answers_sent: AtomicU64,
    candidates_applied: AtomicU64,
    candidates_buffered: AtomicU64,
    data_messages_sent: AtomicU64,
}

/// Peer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub candidates_applied: u64,
    pub candidates_buffered: u64,
    pub data_messages_sent: u64,
}

/// One participant's server-side state
pub struct Peer {
    id: PeerId,
    sfu: Arc<Sfu>,
    state: Mutex<PeerState>,
    session: parking_lot::Mutex<Option<Weak<Session>>>,
    commands_tx: mpsc::UnboundedSender<PeerCommand>,
    commands_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PeerCommand>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    signal_tx: mpsc::UnboundedSender<SignalEvent>,
    signal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    counters: PeerCounters,
    created_at: DateTime<Utc>,
}

impl Peer {
    /// Create a peer with a random id, bound to `sfu`
    #[must_use]
    pub fn new(sfu: Arc<Sfu>) -> Arc<Self> {
        Self::with_id(sfu, PeerId::random())
    }

    #[must_use]
    pub fn with_id(sfu: Arc<Sfu>, id: PeerId) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        debug!(peer_id = %id, "Peer created");
        Arc::new(Self {
            id,
            sfu,
            state: Mutex::new(PeerState {
                legs: [Leg::new(LegKind::Publish), Leg::new(LegKind::Subscribe)],
                session_id: None,
                closed: false,
            }),
            session: parking_lot::Mutex::new(None),
            commands_tx,
            commands_rx: parking_lot::Mutex::new(Some(commands_rx)),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            signal_tx,
            signal_rx: parking_lot::Mutex::new(Some(signal_rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            counters: PeerCounters::default(),
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Take the outbound signal stream (can only be called once).
    ///
    /// The signaling layer drains it and forwards `offer` and `trickle`
    /// notifications to the participant.
    pub fn take_signal_receiver(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.signal_rx.lock().take()
    }

    /// Join (creating if needed) the session `session_id`
    pub async fn join(self: &Arc<Self>, session_id: SessionId) -> Result<()> {
        self.join_session(session_id, None).await.map(|_| ())
    }

    /// Join `session_id` and answer the participant's publish offer.
    ///
    /// The offer is applied before the peer becomes a session member, so a
    /// rejected offer leaves the peer unjoined and the call can be retried.
    pub async fn join_with_offer(
        self: &Arc<Self>,
        session_id: SessionId,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(SfuError::InvalidState(format!(
                "expected an offer, got {}",
                offer.sdp_type.as_str()
            )));
        }
        let answer = self.join_session(session_id, Some(offer)).await?;
        answer.ok_or_else(|| SfuError::Negotiation("join produced no answer".to_string()))
    }

    async fn join_session(
        self: &Arc<Self>,
        session_id: SessionId,
        offer: Option<SessionDescription>,
    ) -> Result<Option<SessionDescription>> {
        let answer = {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            if let Some(current) = &state.session_id {
                return Err(SfuError::InvalidState(format!(
                    "peer {} already joined session {current}",
                    self.id
                )));
            }
            self.create_transports(&mut state).await?;
            let answer = match offer {
                Some(offer) => match self.apply_offer(&mut state, offer).await {
                    Ok(answer) => Some(answer),
                    Err(e) => {
                        warn!(peer_id = %self.id, session_id = %session_id, error = %e, "Join offer rejected");
                        return Err(e);
                    }
                },
                None => None,
            };
            state.session_id = Some(session_id.clone());
            answer
        };

        let session = match self.sfu.attach(&session_id, Arc::clone(self)) {
            Ok(session) => session,
            Err(e) => {
                self.state.lock().await.session_id = None;
                warn!(peer_id = %self.id, session_id = %session_id, error = %e, "Join failed");
                return Err(e);
            }
        };

        if self.is_closed() {
            // Closed while attaching; undo the membership close() could not see
            session.remove_peer(&self.id);
            self.sfu.reap_if_empty(&session_id);
            return Err(SfuError::Closed);
        }

        self.spawn_worker();
        info!(peer_id = %self.id, session_id = %session_id, "Peer joined session");
        if answer.is_some() {
            self.counters.answers_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(answer)
    }

    async fn create_transports(&self, state: &mut PeerState) -> Result<()> {
        let factory = self.sfu.transport_factory();
        let mut created: Vec<Arc<dyn Transport>> = Vec::with_capacity(2);
        for kind in LegKind::ALL {
            if state.leg(kind).transport.is_some() {
                continue;
            }
            match factory.create(&self.id, kind, self.events_tx.clone()).await {
                Ok(transport) => {
                    state.leg_mut(kind).transport = Some(Arc::clone(&transport));
                    created.push(transport);
                }
                Err(e) => {
                    for transport in created {
                        state.leg_mut(transport.leg()).transport = None;
                        let _ = transport.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Apply a participant offer to the publish leg and return our answer
    pub async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(SfuError::InvalidState(format!(
                "expected an offer, got {}",
                offer.sdp_type.as_str()
            )));
        }

        let mut state = self.state.lock().await;
        let answer = self.apply_offer(&mut state, offer).await?;
        drop(state);

        self.counters.answers_sent.fetch_add(1, Ordering::Relaxed);
        debug!(peer_id = %self.id, "Answered publish offer");
        Ok(answer)
    }

    async fn apply_offer(
        &self,
        state: &mut PeerState,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        state.ensure_open()?;
        let leg = state.leg_mut(LegKind::Publish);
        match leg.signaling {
            SignalingState::Stable | SignalingState::HaveRemoteOffer => {}
            SignalingState::HaveLocalOffer => {
                return Err(SfuError::InvalidState(format!(
                    "{} leg has an outstanding local offer",
                    leg.kind
                )))
            }
            SignalingState::Closed => return Err(SfuError::Closed),
        }
        let transport = leg.transport()?;
        let previous = leg.signaling;

        transport.set_remote_description(offer.clone()).await?;
        leg.signaling = SignalingState::HaveRemoteOffer;

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                Self::rollback(&transport, leg, previous).await;
                return Err(e);
            }
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            Self::rollback(&transport, leg, previous).await;
            return Err(e);
        }

        leg.signaling = SignalingState::Stable;
        leg.remote_description = Some(offer);
        leg.local_description = Some(answer.clone());
        self.flush_candidates(leg).await;
        Ok(answer)
    }

    async fn rollback(transport: &Arc<dyn Transport>, leg: &mut Leg, previous: SignalingState) {
        if let Err(e) = transport.rollback().await {
            warn!(leg = %leg.kind, error = %e, "Rollback failed");
        }
        leg.signaling = previous;
    }

    /// Complete a server-initiated offer with the participant's answer
    pub async fn set_remote_description(&self, answer: SessionDescription) -> Result<()> {
        if answer.sdp_type != SdpType::Answer {
            return Err(SfuError::InvalidState(format!(
                "expected an answer, got {}",
                answer.sdp_type.as_str()
            )));
        }

        let offer = {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            let leg = state.leg_mut(LegKind::Subscribe);
            if leg.signaling != SignalingState::HaveLocalOffer {
                return Err(SfuError::InvalidState(format!(
                    "no outstanding offer on {} leg (state {})",
                    leg.kind, leg.signaling
                )));
            }
            let transport = leg.transport()?;
            transport.set_remote_description(answer.clone()).await?;

            leg.signaling = SignalingState::Stable;
            leg.remote_description = Some(answer);
            self.flush_candidates(leg).await;

            // Renegotiation requested while the offer was outstanding
            self.create_offer(&mut state).await
        };

        debug!(peer_id = %self.id, "Subscribe leg answered");
        self.emit_offer(offer);
        Ok(())
    }

    /// Add a remote ICE candidate to leg `target`, buffering it until the
    /// leg has a remote description
    pub async fn trickle(&self, candidate: IceCandidate, target: LegKind) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let leg = state.leg_mut(target);

        match (&leg.transport, &leg.remote_description) {
            (Some(transport), Some(_)) => {
                transport
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|e| match e {
                        SfuError::Closed | SfuError::Negotiation(_) => e,
                        other => SfuError::Negotiation(other.to_string()),
                    })?;
                self.counters.candidates_applied.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                leg.pending_candidates.push_back(candidate);
                self.counters.candidates_buffered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer_id = %self.id,
                    leg = %target,
                    pending = leg.pending_candidates.len(),
                    "Buffered remote candidate"
                );
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, leg: &mut Leg) {
        let Some(transport) = leg.transport.clone() else {
            return;
        };
        while let Some(candidate) = leg.pending_candidates.pop_front() {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => {
                    self.counters.candidates_applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(peer_id = %self.id, leg = %leg.kind, error = %e, "Buffered candidate rejected");
                }
            }
        }
    }

    /// Create and apply a subscribe-leg offer if one is pending and the leg
    /// is stable. The caller emits the returned offer after unlocking.
    async fn create_offer(&self, state: &mut PeerState) -> Option<SessionDescription> {
        if state.closed {
            return None;
        }
        let leg = state.leg_mut(LegKind::Subscribe);
        if !leg.negotiation_pending || leg.signaling != SignalingState::Stable {
            return None;
        }
        let transport = leg.transport.clone()?;

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Failed to create offer");
                self.retry_offer(leg);
                return None;
            }
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            warn!(peer_id = %self.id, error = %e, "Failed to apply local offer");
            if let Err(e) = transport.rollback().await {
                warn!(peer_id = %self.id, error = %e, "Rollback failed");
            }
            self.retry_offer(leg);
            return None;
        }

        leg.offer_failures = 0;
        leg.negotiation_pending = false;
        leg.signaling = SignalingState::HaveLocalOffer;
        leg.local_description = Some(offer.clone());
        Some(offer)
    }

    /// Queue another attempt at the pending offer. After `MAX_OFFER_RETRIES`
    /// consecutive failures the offer waits for the next track change.
    fn retry_offer(&self, leg: &mut Leg) {
        leg.offer_failures += 1;
        if leg.offer_failures > MAX_OFFER_RETRIES {
            warn!(peer_id = %self.id, failures = leg.offer_failures, "Giving up on offer until the next change");
            leg.offer_failures = 0;
            return;
        }
        let commands = self.commands_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(OFFER_RETRY_DELAY) => {
                    let _ = commands.send(PeerCommand::Negotiate);
                }
            }
        });
    }

    fn emit_offer(&self, offer: Option<SessionDescription>) {
        if let Some(offer) = offer {
            self.counters.offers_sent.fetch_add(1, Ordering::Relaxed);
            debug!(peer_id = %self.id, "Sending offer");
            let _ = self.signal_tx.send(SignalEvent::Offer(offer));
        }
    }

    pub(crate) fn enqueue(&self, command: PeerCommand) {
        if self.is_closed() {
            return;
        }
        let _ = self.commands_tx.send(command);
    }

    pub(crate) fn set_session(&self, session: Weak<Session>) {
        *self.session.lock() = Some(session);
    }

    /// Session this peer belongs to, if it is still alive
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().as_ref().and_then(Weak::upgrade)
    }

    fn spawn_worker(self: &Arc<Self>) {
        let commands = self.commands_rx.lock().take();
        let events = self.events_rx.lock().take();
        let (Some(commands), Some(events)) = (commands, events) else {
            return;
        };
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            peer.run_worker(commands, events).await;
        });
    }

    async fn run_worker(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_transport_event(event).await,
                Some(command) = commands.recv() => {
                    let mut batch = vec![command];
                    while let Ok(next) = commands.try_recv() {
                        batch.push(next);
                    }
                    self.apply_commands(batch).await;
                }
                else => break,
            }
        }
        debug!(peer_id = %self.id, "Peer worker stopped");
    }

    async fn apply_commands(&self, batch: Vec<PeerCommand>) {
        let mut outgoing = Vec::new();
        let (offer, transport) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let Some(transport) = state.leg(LegKind::Subscribe).transport.clone() else {
                return;
            };

            let mut changed = false;
            for command in batch {
                match command {
                    PeerCommand::AddTrack {
                        track,
                        sink,
                        feedback,
                    } => {
                        let track_id = track.id.clone();
                        match transport.add_track(track, sink, feedback).await {
                            Ok(()) => changed = true,
                            Err(e) => {
                                warn!(peer_id = %self.id, track_id = %track_id, error = %e, "Failed to add track");
                            }
                        }
                    }
                    PeerCommand::RemoveTrack { track_id } => {
                        match transport.remove_track(&track_id).await {
                            Ok(()) => changed = true,
                            Err(SfuError::NotFound(_)) => {
                                debug!(peer_id = %self.id, track_id = %track_id, "Track was not being sent");
                            }
                            Err(e) => {
                                warn!(peer_id = %self.id, track_id = %track_id, error = %e, "Failed to remove track");
                            }
                        }
                    }
                    PeerCommand::Negotiate => changed = true,
                    PeerCommand::SendData { payload } => outgoing.push(payload),
                }
            }

            if changed {
                state.leg_mut(LegKind::Subscribe).negotiation_pending = true;
            }
            (self.create_offer(&mut state).await, transport)
        };

        self.emit_offer(offer);

        for payload in outgoing {
            match transport.send_data(payload).await {
                Ok(()) => {
                    self.counters.data_messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(peer_id = %self.id, error = %e, "Failed to relay data message"),
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate { leg, candidate } => {
                if !self.is_closed() {
                    let _ = self.signal_tx.send(SignalEvent::Trickle {
                        candidate,
                        target: leg,
                    });
                }
            }
            TransportEvent::ConnectionState { leg, state } => {
                {
                    let mut peer_state = self.state.lock().await;
                    if peer_state.closed {
                        return;
                    }
                    peer_state.leg_mut(leg).ice_state = state;
                }
                debug!(peer_id = %self.id, leg = %leg, state = ?state, "ICE connection state changed");
                if state.is_terminal() {
                    info!(peer_id = %self.id, leg = %leg, state = ?state, "Transport lost, closing peer");
                    self.close().await;
                }
            }
            TransportEvent::TrackPublished(track) => {
                let Some(session) = self.session() else {
                    warn!(peer_id = %self.id, track_id = %track.info.id, "Track published outside a session");
                    return;
                };
                if let Err(e) = session.publish_track(track) {
                    warn!(peer_id = %self.id, error = %e, "Failed to publish track");
                }
            }
            TransportEvent::DataMessage { payload } => {
                if let Some(session) = self.session() {
                    session.broadcast(&self.id, payload);
                }
            }
        }
    }

    /// Tear the peer down. Safe to call more than once; only the first call
    /// has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (transports, session_id) = {
            let mut state = self.state.lock().await;
            state.closed = true;
            let transports: Vec<_> = state.legs.iter_mut().filter_map(Leg::close).collect();
            (transports, state.session_id.clone())
        };
        self.cancel.cancel();

        let session = self.session.lock().take().and_then(|weak| weak.upgrade());
        if let Some(session) = session {
            session.remove_peer(&self.id);
            self.sfu.reap_if_empty(session.id());
        }

        for transport in transports {
            if let Err(e) = transport.close().await {
                debug!(peer_id = %self.id, leg = %transport.leg(), error = %e, "Transport close failed");
            }
        }

        info!(
            peer_id = %self.id,
            session_id = ?session_id.as_ref().map(SessionId::as_str),
            "Peer closed"
        );
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.state.lock().await.session_id.clone()
    }

    pub async fn signaling_state(&self, leg: LegKind) -> SignalingState {
        self.state.lock().await.leg(leg).signaling
    }

    pub async fn ice_state(&self, leg: LegKind) -> IceConnectionState {
        self.state.lock().await.leg(leg).ice_state
    }

    pub async fn local_description(&self, leg: LegKind) -> Option<SessionDescription> {
        self.state.lock().await.leg(leg).local_description.clone()
    }

    pub async fn remote_description(&self, leg: LegKind) -> Option<SessionDescription> {
        self.state.lock().await.leg(leg).remote_description.clone()
    }

    /// Number of remote candidates waiting for leg `leg`'s remote description
    pub async fn pending_candidates(&self, leg: LegKind) -> usize {
        self.state.lock().await.leg(leg).pending_candidates.len()
    }

    #[must_use]
    pub fn get_stats(&self) -> PeerStats {
        PeerStats {
            offers_sent: self.counters.offers_sent.load(Ordering::Relaxed),
            answers_sent: self.counters.answers_sent.load(Ordering::Relaxed),
            candidates_applied: self.counters.candidates_applied.load(Ordering::Relaxed),
            candidates_buffered: self.counters.candidates_buffered.load(Ordering::Relaxed),
            data_messages_sent: self.counters.data_messages_sent.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        debug!(peer_id = %self.id, "Peer dropped");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
