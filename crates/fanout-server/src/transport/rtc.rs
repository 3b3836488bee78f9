//! webrtc-rs backed transport

use super::{
    CodecInfo, FeedbackReader, ForwardError, InboundHandler, InboundTrack, MediaSink,
    MediaTransport, TransportError, TransportSession,
};
use async_trait::async_trait;
use fanout_protocol::{Role, SdpType, SessionDescriptor};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

/// Creates peer connections from one shared webrtc-rs API instance
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    pub fn new(stun_servers: &[String]) -> Result<Self, TransportError> {
        // Default codec set: Opus, VP8, VP9, H.264, AV1 and friends
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // NACK, RTCP reports and TWCC
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    type Session = WebRtcSession;

    async fn new_session(&self, role: Role) -> Result<Arc<WebRtcSession>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            tracing::info!("{} peer connection state changed: {}", role, state);
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        tracing::debug!("Created {} peer connection", role);

        Ok(Arc::new(WebRtcSession {
            peer_connection,
            state: state_rx,
        }))
    }
}

pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
    state: watch::Receiver<RTCPeerConnectionState>,
}

fn to_rtc_description(desc: &SessionDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp.clone();
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => {
            return Err(TransportError::UnsupportedDescription(desc.sdp_type.to_string()));
        }
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescriptor, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(TransportError::UnsupportedDescription(other.to_string())),
    };
    Ok(SessionDescriptor {
        sdp_type,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl TransportSession for WebRtcSession {
    type Inbound = WebRtcInbound;
    type Sink = WebRtcSink;
    type Feedback = WebRtcFeedback;

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let rtc = to_rtc_description(desc)?;
        self.peer_connection.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn gathering_complete(&self) -> BoxFuture<'static, ()> {
        let mut done = self.peer_connection.gathering_complete_promise().await;
        Box::pin(async move {
            let _ = done.recv().await;
        })
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let rtc = to_rtc_description(desc)?;
        self.peer_connection.set_local_description(rtc).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        let desc = self.peer_connection.local_description().await?;
        from_rtc_description(desc).ok()
    }

    fn on_inbound_track(&self, handler: InboundHandler<WebRtcInbound>) {
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                handler(Arc::new(WebRtcInbound { track }))
            }));
    }

    async fn add_outbound(&self, sink: Arc<WebRtcSink>) -> Result<WebRtcFeedback, TransportError> {
        let track = Arc::clone(&sink.track) as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.peer_connection.add_track(track).await?;
        Ok(WebRtcFeedback { sender })
    }

    async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| {
                matches!(
                    s,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                )
            })
            .await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

pub struct WebRtcInbound {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInbound {
    type Sink = WebRtcSink;

    fn id(&self) -> String {
        self.track.id()
    }

    fn codec(&self) -> CodecInfo {
        let codec = self.track.codec();
        CodecInfo {
            kind: self.track.kind().to_string(),
            mime_type: codec.capability.mime_type,
            clock_rate: codec.capability.clock_rate,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet.marshal_to(buf)?)
    }

    fn republish(&self, track_id: &str, stream_id: &str) -> WebRtcSink {
        let track = TrackLocalStaticRTP::new(
            self.track.codec().capability,
            track_id.to_string(),
            stream_id.to_string(),
        );
        WebRtcSink {
            track: Arc::new(track),
        }
    }
}

/// Wraps `TrackLocalStaticRTP`, which writes to every peer it is bound to
pub struct WebRtcSink {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaSink for WebRtcSink {
    async fn write(&self, packet: &[u8]) -> Result<usize, ForwardError> {
        let mut reader = packet;
        let rtp = Packet::unmarshal(&mut reader).map_err(|e| ForwardError::Io(e.to_string()))?;

        // Failures from individual bindings come back flattened into one
        // error, so none of them says anything about the other subscribers
        match self.track.write_rtp(&rtp).await {
            Ok(n) => Ok(n),
            Err(webrtc::Error::ErrClosedPipe) => Err(ForwardError::SinkClosed),
            Err(e) => Err(ForwardError::Undelivered(e.to_string())),
        }
    }
}

pub struct WebRtcFeedback {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl FeedbackReader for WebRtcFeedback {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let (packets, _attributes) = self.sender.read(buf).await?;
        Ok(packets.len())
    }
}
