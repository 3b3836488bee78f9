//! Media transport seam
//!
//! The relay never touches DTLS, SRTP, ICE or RTP parsing itself. It drives
//! an external WebRTC stack through these traits, which keeps the session
//! orchestration testable without a network.

mod rtc;

#[cfg(test)]
pub(crate) mod fake;

pub use rtc::{WebRtcFeedback, WebRtcInbound, WebRtcSession, WebRtcSink, WebRtcTransport};

use async_trait::async_trait;
use fanout_protocol::{Role, SessionDescriptor};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Size of the buffer used for a single RTP or RTCP read
pub const PACKET_BUFFER_SIZE: usize = 1500;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("packet error: {0}")]
    Packet(#[from] webrtc::util::Error),

    #[error("unsupported session description type: {0}")]
    UnsupportedDescription(String),

    #[error("transport session closed")]
    Closed,
}

/// Failure while writing a packet into a re-originated stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// Nobody is bound to the stream yet, or the binding went away
    #[error("sink closed")]
    SinkClosed,

    /// One or more bound sessions did not take the packet; the rest did
    #[error("not delivered to every bound session: {0}")]
    Undelivered(String),

    #[error("forwarding failed: {0}")]
    Io(String),
}

/// Codec details of an inbound track, for logging and status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
}

/// Callback invoked once per inbound track
pub type InboundHandler<T> = Box<dyn Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Factory for transport sessions
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    type Session: TransportSession;

    /// Create a fresh session configured for `role`
    async fn new_session(&self, role: Role) -> Result<Arc<Self::Session>, TransportError>;
}

/// One negotiated peer connection
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    type Inbound: InboundTrack<Sink = Self::Sink>;
    type Sink: MediaSink;
    type Feedback: FeedbackReader;

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError>;

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError>;

    /// Resolves once ICE gathering is complete.
    ///
    /// Must be obtained before the local description is applied, otherwise
    /// the completion event can be missed.
    async fn gathering_complete(&self) -> BoxFuture<'static, ()>;

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError>;

    /// Current local description, including any gathered candidates
    async fn local_description(&self) -> Option<SessionDescriptor>;

    fn on_inbound_track(&self, handler: InboundHandler<Self::Inbound>);

    /// Bind a re-originated stream as an outbound track of this session
    async fn add_outbound(&self, sink: Arc<Self::Sink>) -> Result<Self::Feedback, TransportError>;

    /// Resolves when the session has permanently failed or been closed
    async fn closed(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

/// Media arriving from the remote peer
#[async_trait]
pub trait InboundTrack: Send + Sync + 'static {
    type Sink: MediaSink;

    fn id(&self) -> String;

    fn codec(&self) -> CodecInfo;

    /// Read the next packet, serialized verbatim into `buf`
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Create a local stream with the same codec capability as this track
    fn republish(&self, track_id: &str, stream_id: &str) -> Self::Sink;
}

/// Local stream that fans packets out to every bound session
#[async_trait]
pub trait MediaSink: Send + Sync + 'static {
    async fn write(&self, packet: &[u8]) -> Result<usize, ForwardError>;
}

/// Receiver-side feedback (RTCP) for one outbound track
#[async_trait]
pub trait FeedbackReader: Send + 'static {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}
