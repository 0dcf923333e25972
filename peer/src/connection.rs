use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::{SdpType, SessionDescription, STUN_SERVER};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc_rs::api::interceptor_registry::register_default_interceptors;
use webrtc_rs::api::media_engine::MediaEngine;
use webrtc_rs::api::APIBuilder;
use webrtc_rs::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc_rs::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc_rs::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc_rs::ice_transport::ice_server::RTCIceServer;
use webrtc_rs::interceptor::registry::Registry;
use webrtc_rs::peer_connection::configuration::RTCConfiguration;
use webrtc_rs::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc_rs::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc_rs::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc_rs::peer_connection::signaling_state::RTCSignalingState;
use webrtc_rs::peer_connection::RTCPeerConnection;
use webrtc_rs::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc_rs::track::track_remote::TrackRemote;

use crate::{
    IceGatheringState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventSender, RemoteTrack, SignalingState, TrackKind,
};

/// webrtc-rsでPeerConnectionを生成するファクトリ
pub struct WebRtcPeerFactory {
    ice_urls: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(stun_url: impl Into<String>) -> Self {
        Self {
            ice_urls: vec![stun_url.into()],
        }
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(STUN_SERVER)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        // ICE設定（STUNのみ、認証情報なし）
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );
        info!("PeerConnection created (ice servers: {:?})", self.ice_urls);

        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcPeerConnection { pc }))
    }
}

/// webrtc-rsのRTCPeerConnectionをPeerConnectionとして扱うラッパー
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = to_rtc_description(description)?;
        self.pc.set_remote_description(remote).await?;
        debug!("Remote description set");
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let local = to_rtc_description(description)?;
        self.pc.set_local_description(local).await?;
        debug!("Local description set");
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let local = self.pc.local_description().await?;
        match from_rtc_description(local) {
            Ok(description) => Some(description),
            Err(e) => {
                warn!("Unusable local description: {:#}", e);
                None
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => bail!("Rollback session descriptions are not supported"),
    };
    parsed.context("Failed to parse session description")
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => bail!("Session description has no type"),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

/// コールバックをすべてPeerEventに変換して転送する
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        match mapped {
            Some(state) => forward(&tx, PeerEvent::ConnectionStateChanged(state)),
            None => debug!("PeerConnection state: Unspecified"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let mapped = match state {
            RTCIceGathererState::New => Some(IceGatheringState::New),
            RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
            RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
            RTCIceGathererState::Closed | RTCIceGathererState::Unspecified => None,
        };
        match mapped {
            Some(state) => forward(&tx, PeerEvent::IceGatheringStateChanged(state)),
            None => debug!("ICE gathering state: {:?}", state),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let mapped = match state {
            RTCSignalingState::Stable => Some(SignalingState::Stable),
            RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
            RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
            RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
            RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
            RTCSignalingState::Closed => Some(SignalingState::Closed),
            RTCSignalingState::Unspecified => None,
        };
        match mapped {
            Some(state) => forward(&tx, PeerEvent::SignalingStateChanged(state)),
            None => debug!("Signaling state: Unspecified"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate = match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => Some(init.candidate),
                Err(e) => {
                    forward(&tx, PeerEvent::IceCandidateError(e.to_string()));
                    return Box::pin(async {});
                }
            },
            None => None,
        };
        forward(&tx, PeerEvent::IceCandidate(candidate));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        forward(&tx, PeerEvent::IceConnectionStateChanged(state.to_string()));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        forward(&tx, PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            RTPCodecType::Unspecified => {
                debug!("Ignoring track of unspecified kind");
                return Box::pin(async {});
            }
        };
        let stream_ids = Some(track.stream_id())
            .filter(|id| !id.is_empty())
            .into_iter()
            .collect();
        forward(
            &tx,
            PeerEvent::Track(RemoteTrack {
                kind,
                id: track.id(),
                stream_ids,
                source: Some(track),
            }),
        );
        Box::pin(async {})
    }));
}

fn forward(tx: &PeerEventSender, event: PeerEvent) {
    if tx.send(event).is_err() {
        debug!("PeerSession dropped, discarding peer event");
    }
}
