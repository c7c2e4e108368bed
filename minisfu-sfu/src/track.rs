//! Track and packet primitives
//!
//! A published track is described by [`TrackInfo`]; its media flows as
//! [`MediaPacket`]s from the publisher towards subscribers and its RTCP
//! feedback flows back as [`Feedback`].

use crate::types::{PeerId, TrackId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<TrackKind> for RTPCodecType {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => Self::Audio,
            TrackKind::Video => Self::Video,
        }
    }
}

/// Description of a published track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    /// Media stream (msid) the track belongs to
    pub stream_id: String,
    pub kind: TrackKind,
    /// Codec MIME type, e.g. `video/VP8`
    pub mime_type: String,
    pub publisher: PeerId,
}

/// RTP packet with metadata for forwarding
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Marshalled RTP packet
    pub data: Bytes,

    /// Source SSRC
    pub ssrc: u32,

    pub sequence_number: u16,

    pub timestamp: u32,

    /// When packet was received
    pub received_at: Instant,
}

impl MediaPacket {
    #[must_use]
    pub fn new(data: Bytes, ssrc: u32, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            data,
            ssrc,
            sequence_number,
            timestamp,
            received_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// RTCP feedback a subscriber sends about a forwarded track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Generic NACK: sequence numbers the subscriber did not receive
    Nack { lost: Vec<u16> },
    /// Picture loss indication: the subscriber needs a keyframe
    PictureLoss,
}

impl Feedback {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nack { .. } => "nack",
            Self::PictureLoss => "pli",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_codec_type() {
        assert_eq!(TrackKind::from(RTPCodecType::Audio), TrackKind::Audio);
        assert_eq!(TrackKind::from(RTPCodecType::Video), TrackKind::Video);
        assert_eq!(TrackKind::from(RTPCodecType::Unspecified), TrackKind::Video);
        assert_eq!(RTPCodecType::from(TrackKind::Audio), RTPCodecType::Audio);
    }

    #[test]
    fn test_track_info_serializes_kind_lowercase() {
        let info = TrackInfo {
            id: TrackId::from("t1"),
            stream_id: "s1".to_string(),
            kind: TrackKind::Video,
            mime_type: "video/VP8".to_string(),
            publisher: PeerId::from("alice"),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "video");
        assert_eq!(json["publisher"], "alice");
    }
}
