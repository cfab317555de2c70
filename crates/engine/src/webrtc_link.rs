//! `PeerLink` backed by a webrtc-rs peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use careline_protocol::{IceCandidate, IceConfig, SdpType, SessionDescription};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkState, PeerLink, TransportPolicy};
use crate::media::{LocalTrack, MediaKind, TrackInfo};

/// Builds one webrtc-rs peer connection per link generation.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcLinkFactory;

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        policy: TransportPolicy,
        generation: u64,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice),
            ice_transport_policy: rtc_policy(policy),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        wire_callbacks(&pc, generation, events);

        info!(generation, ?policy, "WebRTC peer connection created");
        Ok(Arc::new(WebRtcLink {
            pc,
            generation,
            policy,
        }))
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
    policy: TransportPolicy,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn policy(&self) -> TransportPolicy {
        self.policy
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be drained for the interceptors to keep working
        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        debug!(generation = self.generation, track = track.id(), "Local track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        log_sdp("Offer SDP", &offer.sdp);
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        log_sdp("Answer SDP", &answer.sdp);
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(generation = self.generation, "Failed to close peer connection: {e}");
        }
    }
}

fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// STUN servers as one entry, TURN servers (with credentials) as another.
pub(crate) fn rtc_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if ice.has_relay() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

pub(crate) fn rtc_policy(policy: TransportPolicy) -> RTCIceTransportPolicy {
    match policy {
        TransportPolicy::All => RTCIceTransportPolicy::All,
        TransportPolicy::RelayOnly => RTCIceTransportPolicy::Relay,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

/// Forward candidates, state changes and remote tracks to the session inbox.
/// The callbacks never touch session state themselves.
fn wire_callbacks(pc: &Arc<RTCPeerConnection>, generation: u64, events: LinkEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(json) => {
                    let candidate = IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    };
                    let _ = tx.send(LinkEvent {
                        generation,
                        kind: LinkEventKind::LocalCandidate(candidate),
                    });
                }
                Err(e) => warn!(generation, "Failed to serialize ICE candidate: {e}"),
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        match state {
            RTCPeerConnectionState::Failed => warn!(generation, "Peer connection failed"),
            RTCPeerConnectionState::Disconnected => warn!(generation, "Peer connection disconnected"),
            _ => info!(generation, ?state, "Peer connection state changed"),
        }
        let _ = tx.send(LinkEvent {
            generation,
            kind: LinkEventKind::StateChanged(link_state(state)),
        });
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        let info = TrackInfo {
            id: track.id(),
            kind,
        };
        info!(generation, track = %info.id, ?kind, "Remote track received");
        let _ = events.send(LinkEvent {
            generation,
            kind: LinkEventKind::RemoteTrack(info),
        });
        // Rendering happens outside the engine; keep the receiver drained.
        tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        Box::pin(async {})
    }));
}

fn log_sdp(label: &'static str, sdp: &str) {
    for line in sdp.lines() {
        if line.starts_with("m=") || line.starts_with("a=rtpmap:") || line.starts_with("a=group:") {
            debug!(sdp_line = line, "{label}");
        }
    }
}
