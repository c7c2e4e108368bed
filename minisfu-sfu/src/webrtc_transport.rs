//! webrtc-rs backed transport legs
//!
//! Each leg is one `RTCPeerConnection`. The publish leg turns remote tracks
//! into [`PublishedTrack`]s; the subscribe leg turns forwarded sinks into
//! `TrackLocalStaticRTP`s and owns the broadcast data channel.

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::router::FeedbackSender;
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
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{
    nack_pairs_from_sequence_numbers, TransportLayerNack,
};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::Marshal;

/// Builds webrtc-rs peer connections from the SFU configuration
pub struct WebRtcTransportFactory {
    api: API,
    rtc_config: RTCConfiguration,
    datachannel_label: String,
}

impl WebRtcTransportFactory {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = config.webrtc.port_range() {
            let ephemeral = EphemeralUDP::new(min, max).map_err(|e| {
                SfuError::InvalidState(format!("invalid ICE port range {min}-{max}: {e}"))
            })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!(min, max, "ICE UDP port range configured");
        }
        if !config.webrtc.nat_1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(
                config.webrtc.nat_1to1_ips.clone(),
                RTCIceCandidateType::Host,
            );
        }
        setting_engine.set_lite(config.webrtc.ice_lite);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = config
            .webrtc
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            datachannel_label: config.datachannel_label.clone(),
        })
    }

    async fn build(
        &self,
        peer_id: &PeerId,
        leg: LegKind,
        events: TransportEventSender,
    ) -> Result<WebRtcTransport> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        let cancel = CancellationToken::new();

        register_ice_handlers(&pc, leg, &events);

        let data_channel = match leg {
            LegKind::Publish => {
                register_track_handler(&pc, peer_id.clone(), &events, cancel.clone());
                register_inbound_data_channel(&pc, self.datachannel_label.clone(), &events);
                None
            }
            LegKind::Subscribe => {
                let dc = pc.create_data_channel(&self.datachannel_label, None).await?;
                watch_data_channel(&dc, &events);
                Some(dc)
            }
        };

        debug!(peer_id = %peer_id, leg = %leg, "Created peer connection");

        Ok(WebRtcTransport {
            peer_id: peer_id.clone(),
            leg,
            pc,
            senders: Mutex::new(HashMap::new()),
            data_channel,
            cancel,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        leg: LegKind,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(self.build(peer_id, leg, events).await?))
    }
}

fn register_ice_handlers(pc: &Arc<RTCPeerConnection>, leg: LegKind, events: &TransportEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::IceCandidate {
                        leg,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    });
                }
                Err(e) => warn!(leg = %leg, error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let state = match state {
                RTCIceConnectionState::Checking => IceConnectionState::Checking,
                RTCIceConnectionState::Connected => IceConnectionState::Connected,
                RTCIceConnectionState::Completed => IceConnectionState::Completed,
                RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                RTCIceConnectionState::Failed => IceConnectionState::Failed,
                RTCIceConnectionState::Closed => IceConnectionState::Closed,
                _ => IceConnectionState::New,
            };
            let _ = tx.send(TransportEvent::ConnectionState { leg, state });
        })
    }));
}

fn register_track_handler(
    pc: &Arc<RTCPeerConnection>,
    peer_id: PeerId,
    events: &TransportEventSender,
    cancel: CancellationToken,
) {
    let tx = events.clone();
    let weak_pc = Arc::downgrade(pc);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            let weak_pc = weak_pc.clone();
            let peer_id = peer_id.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let info = TrackInfo {
                    id: TrackId::new(track.id()),
                    stream_id: track.stream_id(),
                    kind: TrackKind::from(track.kind()),
                    mime_type: track.codec().capability.mime_type,
                    publisher: peer_id,
                };
                info!(
                    track_id = %info.id,
                    publisher = %info.publisher,
                    kind = info.kind.as_str(),
                    codec = %info.mime_type,
                    ssrc = track.ssrc(),
                    "Remote track started"
                );

                let (packet_tx, packet_rx) = mpsc::channel(PUBLISHED_TRACK_CHANNEL_CAPACITY);
                let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

                tokio::spawn(read_remote_track(Arc::clone(&track), packet_tx, cancel));
                tokio::spawn(write_upstream_feedback(weak_pc, track.ssrc(), feedback_rx));

                let _ = tx.send(TransportEvent::TrackPublished(PublishedTrack {
                    info,
                    packets: packet_rx,
                    feedback: feedback_tx,
                }));
            })
        },
    ));
}

async fn read_remote_track(
    track: Arc<TrackRemote>,
    packets: mpsc::Sender<MediaPacket>,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = track.read_rtp() => read,
        };
        match read {
            Ok((rtp, _attributes)) => {
                let data = match rtp.marshal() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(track_id = %track.id(), error = %e, "Failed to marshal RTP packet");
                        continue;
                    }
                };
                let packet = MediaPacket::new(
                    data,
                    rtp.header.ssrc,
                    rtp.header.sequence_number,
                    rtp.header.timestamp,
                );
                if packets.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(track_id = %track.id(), error = %e, "Remote track ended");
                break;
            }
        }
    }
}

async fn write_upstream_feedback(
    pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    mut feedback: mpsc::UnboundedReceiver<Feedback>,
) {
    while let Some(item) = feedback.recv().await {
        let Some(pc) = pc.upgrade() else {
            break;
        };
        let packet: Box<dyn RtcpPacket + Send + Sync> = match item {
            Feedback::PictureLoss => Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            }),
            Feedback::Nack { lost } => Box::new(TransportLayerNack {
                sender_ssrc: 0,
                media_ssrc,
                nacks: nack_pairs_from_sequence_numbers(&lost),
            }),
        };
        if let Err(e) = pc.write_rtcp(&[packet]).await {
            debug!(error = %e, "Failed to write upstream RTCP");
        }
    }
}

fn register_inbound_data_channel(
    pc: &Arc<RTCPeerConnection>,
    label: String,
    events: &TransportEventSender,
) {
    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        if dc.label() == label {
            watch_data_channel(&dc, &tx);
        }
        Box::pin(async {})
    }));
}

fn watch_data_channel(dc: &Arc<RTCDataChannel>, events: &TransportEventSender) {
    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(TransportEvent::DataMessage { payload: msg.data });
        Box::pin(async {})
    }));
}

pub struct WebRtcTransport {
    peer_id: PeerId,
    leg: LegKind,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackId, Arc<RTCRtpSender>>>,
    data_channel: Option<Arc<RTCDataChannel>>,
    cancel: CancellationToken,
}

/// Body carried by rollback descriptions. webrtc-rs parses the SDP of every
/// remote description, rollbacks included, so it must be well formed.
const ROLLBACK_SDP: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            let sdp = if desc.sdp.is_empty() {
                ROLLBACK_SDP.to_string()
            } else {
                desc.sdp
            };
            serde_json::from_value(serde_json::json!({
                "type": "rollback",
                "sdp": sdp,
            }))
            .map_err(SfuError::negotiation)?
        }
    };
    Ok(rtc)
}

/// Which side of the negotiation a rollback has to undo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingSide {
    Local,
    Remote,
}

fn pending_side(state: RTCSignalingState) -> Result<Option<PendingSide>> {
    match state {
        RTCSignalingState::Stable => Ok(None),
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            Ok(Some(PendingSide::Local))
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            Ok(Some(PendingSide::Remote))
        }
        other => Err(SfuError::InvalidState(format!(
            "cannot roll back in signaling state {other}"
        ))),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(SfuError::Negotiation(
                "description has no type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn leg(&self) -> LegKind {
        self.leg
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn rollback(&self) -> Result<()> {
        let Some(side) = pending_side(self.pc.signaling_state())? else {
            return Ok(());
        };
        let desc = to_rtc_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })?;
        let result = match side {
            PendingSide::Local => self.pc.set_local_description(desc).await,
            PendingSide::Remote => self.pc.set_remote_description(desc).await,
        };

        // The state change lands before webrtc-rs re-applies the restored
        // description, so a stable connection means the rollback took.
        let state = self.pc.signaling_state();
        match result {
            Ok(()) if state == RTCSignalingState::Stable => Ok(()),
            Err(e) if state == RTCSignalingState::Stable => {
                debug!(peer_id = %self.peer_id, leg = %self.leg, error = %e, "Rollback post-processing failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(()) => Err(SfuError::Negotiation(format!(
                "rollback left {} leg in signaling state {state}",
                self.leg
            ))),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(
        &self,
        track: TrackInfo,
        sink: Arc<PacketSink>,
        feedback: FeedbackSender,
    ) -> Result<()> {
        if self.leg != LegKind::Subscribe {
            return Err(SfuError::InvalidState(
                "tracks can only be added to the subscribe leg".to_string(),
            ));
        }

        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: track.mime_type.clone(),
                ..Default::default()
            },
            track.id.to_string(),
            track.stream_id.clone(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        tokio::spawn(write_forwarded_track(
            local,
            sink,
            self.cancel.clone(),
            track.id.clone(),
        ));
        tokio::spawn(read_subscriber_feedback(Arc::clone(&sender), feedback));

        if let Some(old) = self.senders.lock().insert(track.id.clone(), sender) {
            debug!(peer_id = %self.peer_id, track_id = %track.id, "Replaced existing sender");
            drop(old);
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => {
                self.pc.remove_track(&sender).await?;
                Ok(())
            }
            None => Err(SfuError::NotFound(format!(
                "track {track_id} is not sent to peer {}",
                self.peer_id
            ))),
        }
    }

    async fn send_data(&self, payload: Bytes) -> Result<()> {
        let dc = self.data_channel.as_ref().ok_or_else(|| {
            SfuError::InvalidState(format!("{} leg has no data channel", self.leg))
        })?;
        dc.send(&payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.senders.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}

async fn write_forwarded_track(
    local: Arc<TrackLocalStaticRTP>,
    sink: Arc<PacketSink>,
    cancel: CancellationToken,
    track_id: TrackId,
) {
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            packet = sink.recv() => packet,
        };
        let Some(packet) = packet else {
            break;
        };
        if let Err(e) = local.write(&packet.data).await {
            debug!(track_id = %track_id, error = %e, "Failed to write forwarded packet");
        }
    }
    debug!(track_id = %track_id, "Forwarding writer stopped");
}

async fn read_subscriber_feedback(sender: Arc<RTCRtpSender>, feedback: FeedbackSender) {
    while let Ok((packets, _attributes)) = sender.read_rtcp().await {
        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                feedback.send(Feedback::PictureLoss);
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                let lost = nack.nacks.iter().flat_map(|pair| pair.packet_list()).collect();
                feedback.send(Feedback::Nack { lost });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_description_converts() {
        let rtc = to_rtc_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(rtc.sdp, ROLLBACK_SDP);
    }

    #[test]
    fn test_pending_side_follows_signaling_state() {
        assert_eq!(pending_side(RTCSignalingState::Stable).unwrap(), None);
        assert_eq!(
            pending_side(RTCSignalingState::HaveLocalOffer).unwrap(),
            Some(PendingSide::Local)
        );
        assert_eq!(
            pending_side(RTCSignalingState::HaveRemoteOffer).unwrap(),
            Some(PendingSide::Remote)
        );
        assert!(matches!(
            pending_side(RTCSignalingState::Closed),
            Err(SfuError::InvalidState(_))
        ));
    }

    fn offline_factory() -> WebRtcTransportFactory {
        let mut config = SfuConfig::default();
        config.webrtc.ice_servers.clear();
        WebRtcTransportFactory::new(&config).unwrap()
    }

    async fn leg(factory: &WebRtcTransportFactory, peer: &str, leg: LegKind) -> WebRtcTransport {
        let (tx, _rx) = mpsc::unbounded_channel();
        factory.build(&PeerId::from(peer), leg, tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_rollback_undoes_remote_offer() {
        let factory = offline_factory();
        let client = leg(&factory, "client", LegKind::Subscribe).await;
        let server = leg(&factory, "server", LegKind::Publish).await;

        let offer = client.create_offer().await.unwrap();
        server.set_remote_description(offer).await.unwrap();
        assert_eq!(server.pc.signaling_state(), RTCSignalingState::HaveRemoteOffer);

        server.rollback().await.unwrap();
        assert_eq!(server.pc.signaling_state(), RTCSignalingState::Stable);
        assert!(server.pc.pending_remote_description().await.is_none());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_undoes_local_offer() {
        let factory = offline_factory();
        let server = leg(&factory, "server", LegKind::Subscribe).await;

        let offer = server.create_offer().await.unwrap();
        server.set_local_description(offer).await.unwrap();
        assert_eq!(server.pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        server.rollback().await.unwrap();
        assert_eq!(server.pc.signaling_state(), RTCSignalingState::Stable);

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_when_stable_is_noop() {
        let factory = offline_factory();
        let server = leg(&factory, "server", LegKind::Publish).await;
        server.rollback().await.unwrap();
        assert_eq!(server.pc.signaling_state(), RTCSignalingState::Stable);
        server.close().await.unwrap();
    }

    #[test]
    fn test_invalid_offer_is_negotiation_error() {
        let err = to_rtc_description(SessionDescription::offer("not an sdp")).unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_factory_builds_from_default_config() {
        let factory = WebRtcTransportFactory::new(&SfuConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerId::from("alice"), LegKind::Subscribe, tx)
            .await
            .unwrap();
        assert_eq!(transport.leg(), LegKind::Subscribe);
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        transport.close().await.unwrap();
    }
}
