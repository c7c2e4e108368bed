//! Test helpers and fixtures for minisfu-sfu tests
//!
//! [`LoopbackFactory`] builds in-memory transports that understand a tiny
//! SDP dialect: every `m=` line followed by `a=msid:<stream> <track>` is one
//! track. Once a publish leg answers an offer it announces those tracks the
//! way a real transport would on `ontrack`, and tests reach into the
//! transports to push packets, end tracks, raise events and inspect what was
//! sent. Offers applied on either side can be rolled back until answered.

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::SignalEvent;
use crate::router::FeedbackSender;
use crate::sfu::Sfu;
use crate::sink::PacketSink;
use crate::track::{Feedback, MediaPacket, TrackInfo, TrackKind};
use crate::transport::{
    PublishedTrack, Transport, TransportEvent, TransportEventSender, TransportFactory,
    PUBLISHED_TRACK_CHANNEL_CAPACITY,
};
use crate::types::{
    IceCandidate, IceConnectionState, LegKind, PeerId, SdpType, SessionDescription, TrackId,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default wait used by the helpers below
pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Build an SDP body announcing `tracks` as `(kind, stream, track)`
pub fn sdp_with_tracks(tracks: &[(TrackKind, &str, &str)]) -> String {
    let mut sdp = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    for (kind, stream, track) in tracks {
        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{stream} {track}\r\n",
            kind.as_str()
        ));
    }
    sdp
}

/// Tracks announced in an SDP body built by [`sdp_with_tracks`]
pub fn tracks_in_sdp(sdp: &str) -> Vec<(TrackKind, String, TrackId)> {
    let mut tracks = Vec::new();
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            if let (Some(kind), Some((stream, track))) = (kind, msid.split_once(' ')) {
                tracks.push((kind, stream.to_string(), TrackId::from(track.trim())));
            }
        }
    }
    tracks
}

/// Track ids announced in an offer
pub fn offered_track_ids(offer: &SessionDescription) -> Vec<TrackId> {
    tracks_in_sdp(&offer.sdp)
        .into_iter()
        .map(|(_, _, id)| id)
        .collect()
}

/// An answer a participant would send back for any server offer
pub fn client_answer() -> SessionDescription {
    SessionDescription::answer(sdp_with_tracks(&[]))
}

/// A `PublishedTrack` wired to channels the test keeps
pub fn published_track(
    publisher: &str,
    track_id: &str,
    kind: TrackKind,
) -> (
    PublishedTrack,
    mpsc::Sender<MediaPacket>,
    mpsc::UnboundedReceiver<Feedback>,
) {
    let (packets_tx, packets) = mpsc::channel(PUBLISHED_TRACK_CHANNEL_CAPACITY);
    let (feedback, upstream) = mpsc::unbounded_channel();
    let track = PublishedTrack {
        info: track_info(publisher, track_id, kind),
        packets,
        feedback,
    };
    (track, packets_tx, upstream)
}

pub fn track_info(publisher: &str, track_id: &str, kind: TrackKind) -> TrackInfo {
    TrackInfo {
        id: TrackId::from(track_id),
        stream_id: format!("{publisher}-stream"),
        kind,
        mime_type: mime_type(kind).to_string(),
        publisher: PeerId::from(publisher),
    }
}

const fn mime_type(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio/opus",
        TrackKind::Video => "video/VP8",
    }
}

pub fn test_packet(sequence_number: u16) -> MediaPacket {
    MediaPacket::new(
        Bytes::from(sequence_number.to_be_bytes().to_vec()),
        0x1234,
        sequence_number,
        u32::from(sequence_number) * 90,
    )
}

/// An SFU with default config over loopback transports
pub fn test_sfu() -> (Arc<Sfu>, Arc<LoopbackFactory>) {
    test_sfu_with(SfuConfig::default())
}

pub fn test_sfu_with(config: SfuConfig) -> (Arc<Sfu>, Arc<LoopbackFactory>) {
    let factory = LoopbackFactory::new();
    let sfu = Sfu::new(config, Arc::clone(&factory) as Arc<dyn TransportFactory>);
    (sfu, factory)
}

/// Next signal event, or `None` if nothing arrives within `TEST_TIMEOUT`
pub async fn next_signal(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> Option<SignalEvent> {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv()).await.ok().flatten()
}

/// Next offer, skipping trickle events
pub async fn next_offer(
    rx: &mut mpsc::UnboundedReceiver<SignalEvent>,
) -> Option<SessionDescription> {
    loop {
        match next_signal(rx).await? {
            SignalEvent::Offer(offer) => return Some(offer),
            SignalEvent::Trickle { .. } => {}
        }
    }
}

/// Assert no offer arrives within `wait`
pub async fn expect_no_offer(rx: &mut mpsc::UnboundedReceiver<SignalEvent>, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(SignalEvent::Offer(offer))) => panic!("unexpected offer: {}", offer.sdp),
            Ok(Some(SignalEvent::Trickle { .. })) => {}
        }
    }
}

/// Poll `condition` until it holds, panicking after `TEST_TIMEOUT`
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {TEST_TIMEOUT:?}");
}

/// Builds [`LoopbackTransport`]s and keeps them reachable by peer and leg
#[derive(Default)]
pub struct LoopbackFactory {
    transports: Mutex<HashMap<(PeerId, LegKind), Arc<LoopbackTransport>>>,
    fail_create: Mutex<bool>,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `create` call fail
    pub fn fail_next_create(&self) {
        *self.fail_create.lock() = true;
    }

    pub fn transport(&self, peer_id: &PeerId, leg: LegKind) -> Option<Arc<LoopbackTransport>> {
        self.transports.lock().get(&(peer_id.clone(), leg)).cloned()
    }

    pub fn publish_leg(&self, peer_id: &PeerId) -> Arc<LoopbackTransport> {
        self.transport(peer_id, LegKind::Publish)
            .unwrap_or_else(|| panic!("no publish leg for {peer_id}"))
    }

    pub fn subscribe_leg(&self, peer_id: &PeerId) -> Arc<LoopbackTransport> {
        self.transport(peer_id, LegKind::Subscribe)
            .unwrap_or_else(|| panic!("no subscribe leg for {peer_id}"))
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        leg: LegKind,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>> {
        if std::mem::take(&mut *self.fail_create.lock()) {
            return Err(SfuError::Negotiation("transport creation failed".to_string()));
        }
        let transport = Arc::new(LoopbackTransport::new(peer_id.clone(), leg, events));
        self.transports
            .lock()
            .insert((peer_id.clone(), leg), Arc::clone(&transport));
        Ok(transport)
    }
}

struct SentTrack {
    info: TrackInfo,
    sink: Arc<PacketSink>,
    feedback: FeedbackSender,
}

struct InboundTrack {
    packets: mpsc::Sender<MediaPacket>,
    upstream: Option<mpsc::UnboundedReceiver<Feedback>>,
}

#[derive(Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    sent_tracks: BTreeMap<TrackId, SentTrack>,
    inbound_tracks: HashMap<TrackId, InboundTrack>,
    applied_candidates: Vec<IceCandidate>,
    sent_data: Vec<Bytes>,
    /// Descriptions to restore if the outstanding offer is rolled back
    rollback_local: Option<Option<SessionDescription>>,
    rollback_remote: Option<Option<SessionDescription>>,
    offers_created: usize,
    rollbacks: usize,
    fail_next_remote: bool,
    fail_next_answer: bool,
    fail_next_offer: bool,
    closed: bool,
}

/// In-memory transport leg
pub struct LoopbackTransport {
    peer_id: PeerId,
    leg: LegKind,
    events: TransportEventSender,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    fn new(peer_id: PeerId, leg: LegKind, events: TransportEventSender) -> Self {
        Self {
            peer_id,
            leg,
            events,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Make the next `set_remote_description` fail
    pub fn fail_next_remote_description(&self) {
        self.state.lock().fail_next_remote = true;
    }

    /// Make the next `create_answer` fail
    pub fn fail_next_answer(&self) {
        self.state.lock().fail_next_answer = true;
    }

    /// Make the next `create_offer` fail
    pub fn fail_next_offer(&self) {
        self.state.lock().fail_next_offer = true;
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Deliver a packet on an inbound track, as if received from the wire
    pub async fn push_packet(&self, track_id: &TrackId, packet: MediaPacket) -> bool {
        let sender = self
            .state
            .lock()
            .inbound_tracks
            .get(track_id)
            .map(|track| track.packets.clone());
        match sender {
            Some(sender) => sender.send(packet).await.is_ok(),
            None => false,
        }
    }

    /// End an inbound track, as if the participant stopped sending it
    pub fn end_track(&self, track_id: &TrackId) -> bool {
        self.state.lock().inbound_tracks.remove(track_id).is_some()
    }

    /// RTCP the SFU relayed upstream for an inbound track
    pub fn take_upstream(&self, track_id: &TrackId) -> Option<mpsc::UnboundedReceiver<Feedback>> {
        self.state
            .lock()
            .inbound_tracks
            .get_mut(track_id)
            .and_then(|track| track.upstream.take())
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::IceCandidate {
            leg: self.leg,
            candidate,
        });
    }

    pub fn emit_state(&self, state: IceConnectionState) {
        let _ = self
            .events
            .send(TransportEvent::ConnectionState { leg: self.leg, state });
    }

    pub fn emit_data(&self, payload: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::DataMessage {
            payload: payload.into(),
        });
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .applied_candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn sent_track_ids(&self) -> Vec<TrackId> {
        self.state.lock().sent_tracks.keys().cloned().collect()
    }

    pub fn sent_track(&self, track_id: &TrackId) -> Option<TrackInfo> {
        self.state
            .lock()
            .sent_tracks
            .get(track_id)
            .map(|track| track.info.clone())
    }

    pub fn sink(&self, track_id: &TrackId) -> Option<Arc<PacketSink>> {
        self.state
            .lock()
            .sent_tracks
            .get(track_id)
            .map(|track| Arc::clone(&track.sink))
    }

    pub fn feedback(&self, track_id: &TrackId) -> Option<FeedbackSender> {
        self.state
            .lock()
            .sent_tracks
            .get(track_id)
            .map(|track| track.feedback.clone())
    }

    pub fn sent_data(&self) -> Vec<Bytes> {
        self.state.lock().sent_data.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(state: &LoopbackState) -> Result<()> {
        if state.closed {
            Err(SfuError::Closed)
        } else {
            Ok(())
        }
    }

    /// Announce tracks of an answered publish offer that are new, and end
    /// the ones the offer no longer carries
    fn sync_inbound_tracks(&self, state: &mut LoopbackState, sdp: &str) {
        let offered = tracks_in_sdp(sdp);
        state
            .inbound_tracks
            .retain(|id, _| offered.iter().any(|(_, _, offered_id)| offered_id == id));

        for (kind, stream_id, id) in offered {
            if state.inbound_tracks.contains_key(&id) {
                continue;
            }
            let (packets_tx, packets) = mpsc::channel(PUBLISHED_TRACK_CHANNEL_CAPACITY);
            let (feedback, upstream) = mpsc::unbounded_channel();
            let info = TrackInfo {
                id: id.clone(),
                stream_id,
                kind,
                mime_type: mime_type(kind).to_string(),
                publisher: self.peer_id.clone(),
            };
            state.inbound_tracks.insert(
                id,
                InboundTrack {
                    packets: packets_tx,
                    upstream: Some(upstream),
                },
            );
            let _ = self
                .events
                .send(TransportEvent::TrackPublished(PublishedTrack {
                    info,
                    packets,
                    feedback,
                }));
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn leg(&self) -> LegKind {
        self.leg
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if std::mem::take(&mut state.fail_next_remote) {
            return Err(SfuError::Negotiation("remote description rejected".to_string()));
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(SfuError::Negotiation("malformed sdp".to_string()));
        }
        match desc.sdp_type {
            SdpType::Offer => {
                if state.rollback_remote.is_none() {
                    state.rollback_remote = Some(state.remote.clone());
                }
            }
            _ => state.rollback_local = None,
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match desc.sdp_type {
            SdpType::Offer => {
                if state.rollback_local.is_none() {
                    state.rollback_local = Some(state.local.clone());
                }
            }
            _ => {
                state.rollback_remote = None;
                let answered = state
                    .remote
                    .as_ref()
                    .filter(|remote| remote.sdp_type == SdpType::Offer)
                    .map(|remote| remote.sdp.clone());
                if let (LegKind::Publish, Some(sdp)) = (self.leg, answered) {
                    self.sync_inbound_tracks(&mut state, &sdp);
                }
            }
        }
        state.local = Some(desc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if std::mem::take(&mut state.fail_next_offer) {
            return Err(SfuError::Negotiation("offer creation failed".to_string()));
        }
        let tracks: Vec<(TrackKind, &str, &str)> = state
            .sent_tracks
            .values()
            .map(|t| (t.info.kind, t.info.stream_id.as_str(), t.info.id.as_str()))
            .collect();
        let mut sdp = sdp_with_tracks(&tracks);
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        state.offers_created += 1;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if std::mem::take(&mut state.fail_next_answer) {
            return Err(SfuError::Negotiation("answer creation failed".to_string()));
        }
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(sdp_with_tracks(&[])))
            }
            _ => Err(SfuError::Negotiation("no remote offer to answer".to_string())),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if let Some(previous) = state.rollback_remote.take() {
            state.remote = previous;
        }
        if let Some(previous) = state.rollback_local.take() {
            state.local = previous;
        }
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(SfuError::Negotiation(format!(
                "invalid candidate: {}",
                candidate.candidate
            )));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(
        &self,
        track: TrackInfo,
        sink: Arc<PacketSink>,
        feedback: FeedbackSender,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.sent_tracks.insert(
            track.id.clone(),
            SentTrack {
                info: track,
                sink,
                feedback,
            },
        );
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state
            .sent_tracks
            .remove(track_id)
            .map(|_| ())
            .ok_or_else(|| SfuError::NotFound(format!("track {track_id} is not being sent")))
    }

    async fn send_data(&self, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.sent_data.push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.inbound_tracks.clear();
        Ok(())
    }
}
