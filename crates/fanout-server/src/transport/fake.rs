//! In-memory transport for exercising the relay without a network

use super::{
    CodecInfo, FeedbackReader, ForwardError, InboundHandler, InboundTrack, MediaSink,
    MediaTransport, TransportError, TransportSession,
};
use async_trait::async_trait;
use fanout_protocol::{Role, SessionDescriptor};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Offers whose sdp contains this marker fail when applied
pub const REJECT_REMOTE: &str = "reject-remote";

#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    fail_sessions: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_new_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn sessions(&self, role: Role) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.role == role)
            .cloned()
            .collect()
    }

    pub fn publisher(&self) -> Arc<FakeSession> {
        self.sessions(Role::Publisher)
            .into_iter()
            .next()
            .expect("no publisher session")
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    type Session = FakeSession;

    async fn new_session(&self, role: Role) -> Result<Arc<FakeSession>, TransportError> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let session = Arc::new(FakeSession::new(role));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    pub role: Role,
    remote: Mutex<Option<SessionDescriptor>>,
    local: Mutex<Option<SessionDescriptor>>,
    inbound_handler: Mutex<Option<Arc<InboundHandler<FakeInbound>>>>,
    outbound: Mutex<Vec<Arc<FakeSink>>>,
    closed: watch::Sender<bool>,
}

impl FakeSession {
    fn new(role: Role) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            role,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            inbound_handler: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
            closed,
        }
    }

    /// Announce a new inbound track, as the remote peer starting to send
    pub async fn push_track(&self, id: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(FakeInbound {
            id: id.to_string(),
            packets: tokio::sync::Mutex::new(rx),
        });
        let handler = self.inbound_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(track).await;
        }
        tx
    }

    pub fn outbound(&self) -> Vec<Arc<FakeSink>> {
        self.outbound.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Simulate the remote peer going away
    pub fn disconnect(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    type Inbound = FakeInbound;
    type Sink = FakeSink;
    type Feedback = FakeFeedback;

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        if desc.sdp.contains(REJECT_REMOTE) {
            return Err(TransportError::UnsupportedDescription(desc.sdp.clone()));
        }
        *self.remote.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let remote = self.remote.lock().unwrap().clone();
        let remote = remote.ok_or(TransportError::Closed)?;
        Ok(SessionDescriptor::answer(format!("answer-to:{}", remote.sdp)))
    }

    async fn gathering_complete(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        *self.local.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescriptor> {
        // Gathered candidates end up in the final description
        self.local.lock().unwrap().clone().map(|mut desc| {
            desc.sdp.push_str("\r\na=candidate:fake");
            desc
        })
    }

    fn on_inbound_track(&self, handler: InboundHandler<FakeInbound>) {
        *self.inbound_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    async fn add_outbound(&self, sink: Arc<FakeSink>) -> Result<FakeFeedback, TransportError> {
        self.outbound.lock().unwrap().push(sink);
        Ok(FakeFeedback {
            closed: self.closed.subscribe(),
        })
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

pub struct FakeInbound {
    id: String,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl InboundTrack for FakeInbound {
    type Sink = FakeSink;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn codec(&self) -> CodecInfo {
        CodecInfo {
            kind: "video".to_string(),
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let packet = self
            .packets
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn republish(&self, track_id: &str, _stream_id: &str) -> FakeSink {
        FakeSink::new(track_id)
    }
}

pub struct FakeSink {
    pub track_id: String,
    written: Mutex<Vec<Vec<u8>>>,
    result: Mutex<Option<ForwardError>>,
}

impl FakeSink {
    pub fn new(track_id: &str) -> Self {
        Self {
            track_id: track_id.to_string(),
            written: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        }
    }

    /// Make every following write fail with `error`
    pub fn fail_with(&self, error: ForwardError) {
        *self.result.lock().unwrap() = Some(error);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSink for FakeSink {
    async fn write(&self, packet: &[u8]) -> Result<usize, ForwardError> {
        if let Some(error) = self.result.lock().unwrap().clone() {
            return Err(error);
        }
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }
}

pub struct FakeFeedback {
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FeedbackReader for FakeFeedback {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        let _ = self.closed.wait_for(|c| *c).await;
        Err(TransportError::Closed)
    }
}
