//! minisfu SFU (Selective Forwarding Unit)
//!
//! Peers join named sessions over two WebRTC transports each: a publish leg
//! carrying the participant's media to us and a subscribe leg carrying
//! everyone else's media back. Every published track gets a [`Router`] that
//! fans its packets out to one bounded [`PacketSink`] per subscriber.
//!
//! ## Architecture
//!
//! - **`Sfu`**: registry of sessions, created on first join and removed
//!   when the last peer leaves
//! - **`Session`**: peers and routers of one room
//! - **`Peer`**: publish and subscribe signaling state machines of one
//!   participant
//! - **`Router`**: fan-out of one track plus RTCP feedback back to the
//!   publisher
//! - **`Transport`**: seam over the WebRTC stack; [`WebRtcTransportFactory`]
//!   is the webrtc-rs implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use minisfu_sfu::{Peer, Sfu, SfuConfig, SessionId};
//!
//! let sfu = Sfu::with_webrtc(SfuConfig::default())?;
//! let peer = Peer::new(sfu.clone());
//! let mut signals = peer.take_signal_receiver().unwrap();
//! peer.join(SessionId::from("room1")).await?;
//! let answer = peer.answer(client_offer).await?;
//! ```

mod config;
mod error;
mod peer;
mod router;
mod session;
mod sfu;
mod sink;
mod track;
mod transport;
mod types;
mod webrtc_transport;

pub mod test_helpers;

pub use config::{IceServerConfig, SfuConfig, WebRtcConfig, DEFAULT_DATACHANNEL_LABEL, MIN_PORT_RANGE};
pub use error::{ErrorKind, Result, SfuError};
pub use peer::{Peer, PeerStats, SignalEvent};
pub use router::{FeedbackSender, Router, RouterStats};
pub use session::{Session, SessionStats};
pub use sfu::{Sfu, SfuStats};
pub use sink::{PacketSink, PushOutcome};
pub use track::{Feedback, MediaPacket, TrackInfo, TrackKind};
pub use transport::{
    PublishedTrack, Transport, TransportEvent, TransportEventSender, TransportFactory,
    PUBLISHED_TRACK_CHANNEL_CAPACITY,
};
pub use types::{
    IceCandidate, IceConnectionState, LegKind, PeerId, SdpType, SessionDescription, SessionId,
    SignalingState, TrackId,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
