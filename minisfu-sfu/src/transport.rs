//! Transport seam
//!
//! A peer drives two [`Transport`]s (its publish and subscribe legs) without
//! knowing which WebRTC stack sits underneath. Transports report what
//! happens on the wire through [`TransportEvent`]s sent to the owning peer.

use crate::error::Result;
use crate::router::FeedbackSender;
use crate::sink::PacketSink;
use crate::track::{Feedback, MediaPacket, TrackInfo};
use crate::types::{IceCandidate, IceConnectionState, LegKind, PeerId, SessionDescription, TrackId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the channel carrying a published track's packets to its router
pub const PUBLISHED_TRACK_CHANNEL_CAPACITY: usize = 512;

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// A track the participant started sending on the publish leg
pub struct PublishedTrack {
    pub info: TrackInfo,
    /// Inbound RTP; closes when the track or the leg ends
    pub packets: mpsc::Receiver<MediaPacket>,
    /// Feedback written here is sent to the participant as RTCP
    pub feedback: mpsc::UnboundedSender<Feedback>,
}

impl std::fmt::Debug for PublishedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedTrack").field("info", &self.info).finish()
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Locally gathered candidate to trickle to the participant
    IceCandidate {
        leg: LegKind,
        candidate: IceCandidate,
    },
    ConnectionState {
        leg: LegKind,
        state: IceConnectionState,
    },
    TrackPublished(PublishedTrack),
    /// Payload received on the session's broadcast data channel
    DataMessage { payload: Bytes },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn leg(&self) -> LegKind;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Return to the last stable description after a failed negotiation step
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start sending a forwarded track read from `sink`. Subscribe leg only.
    async fn add_track(
        &self,
        track: TrackInfo,
        sink: Arc<PacketSink>,
        feedback: FeedbackSender,
    ) -> Result<()>;

    async fn remove_track(&self, track_id: &TrackId) -> Result<()>;

    /// Send a payload on the broadcast data channel
    async fn send_data(&self, payload: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates the transport legs of new peers
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &PeerId,
        leg: LegKind,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>>;
}
