//! WebRTC-backed collaborators
//!
//! [`RtcConnector`] builds links on top of `RTCPeerConnection`, and
//! [`RtcMediaSource`] hands out Opus tracks the application feeds with
//! encoded microphone samples.

use crate::config::CallConfig;
use crate::connection::{ConnectionError, LinkEvent, LinkEventSink, PeerConnector, PeerLink};
use crate::media::{LocalAudio, LocalTrack, MediaError, MediaSource};
use crate::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn negotiation(err: webrtc::Error) -> ConnectionError {
    ConnectionError::Negotiation(err.to_string())
}

fn setup(err: webrtc::Error) -> ConnectionError {
    ConnectionError::ConfigError(err.to_string())
}

/// Opus capture track handed out by [`RtcMediaSource`]
pub struct RtcLocalAudio {
    track: Arc<TrackLocalStaticSample>,
    stopped: bool,
}

impl RtcLocalAudio {
    /// Track to write encoded samples into
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Whether `stop` ran
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl LocalAudio for RtcLocalAudio {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![LocalTrack::audio(self.track.id())]
    }

    fn stop(&mut self) {
        self.stopped = true;
        tracing::debug!(track_id = %self.track.id(), "Stopped local audio track");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source producing Opus sample tracks
#[derive(Debug, Default)]
pub struct RtcMediaSource;

impl RtcMediaSource {
    /// Create a media source
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError> {
        let codec = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            format!("audio-{}", Uuid::new_v4()),
            format!("voice-{}", Uuid::new_v4()),
        ));
        Ok(Box::new(RtcLocalAudio {
            track,
            stopped: false,
        }))
    }
}

/// Connector building `RTCPeerConnection`s
#[derive(Debug, Default)]
pub struct RtcConnector;

impl RtcConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create(
        &self,
        config: &CallConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, ConnectionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(setup)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(setup)?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(state = %state, "Peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => sink.emit(LinkEvent::Connected),
                    RTCPeerConnectionState::Failed => {
                        sink.emit(LinkEvent::Failed("peer connection failed".to_string()));
                    }
                    RTCPeerConnectionState::Closed => sink.emit(LinkEvent::Closed),
                    _ => {}
                }
            })
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(LinkEvent::RemoteTrack(RemoteTrack {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind: track.kind().to_string(),
                    }));
                })
            },
        ));

        tracing::debug!("Created peer connection");
        Ok(Box::new(RtcLink { pc }))
    }
}

/// [`PeerLink`] over one `RTCPeerConnection`
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcLink {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation)
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), ConnectionError> {
        let audio = audio
            .as_any()
            .downcast_ref::<RtcLocalAudio>()
            .ok_or_else(|| {
                ConnectionError::ConfigError("local audio was not created by RtcMediaSource".to_string())
            })?;
        self.pc
            .add_track(audio.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| ConnectionError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Peer connection close reported an error");
        }
    }
}
