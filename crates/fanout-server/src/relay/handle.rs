use crate::transport::{CodecInfo, ForwardError, MediaSink};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stream id every re-originated track is published under
pub const STREAM_ID: &str = "fanout";

/// The relay's own copy of the inbound media.
///
/// Created once, from the first inbound track that delivers a packet. The
/// publish side is the only writer; subscriber sessions bind the sink as
/// their outbound track and never write to it.
pub struct MediaStreamHandle<S> {
    track_id: String,
    source_track_id: String,
    codec: CodecInfo,
    sink: Arc<S>,
    created_at: DateTime<Utc>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl<S: MediaSink> MediaStreamHandle<S> {
    pub fn new(source_track_id: &str, codec: CodecInfo, sink: S) -> Self {
        Self {
            track_id: codec.kind.clone(),
            source_track_id: source_track_id.to_string(),
            codec,
            sink: Arc::new(sink),
            created_at: Utc::now(),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Id of the inbound track this stream republishes
    pub fn source_track_id(&self) -> &str {
        &self.source_track_id
    }

    pub fn codec(&self) -> &CodecInfo {
        &self.codec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The fan-out sink, for binding to outbound sessions
    pub fn sink(&self) -> Arc<S> {
        Arc::clone(&self.sink)
    }

    pub fn packets_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write one packet verbatim.
    ///
    /// A closed sink only means nobody is listening yet, and a packet some
    /// subscriber failed to take is that subscriber's problem. Both count
    /// as dropped and return `Ok`. Any other failure is handed back.
    pub(crate) async fn forward(&self, packet: &[u8]) -> Result<(), ForwardError> {
        match self.sink.write(packet).await {
            Ok(_) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(ForwardError::SinkClosed) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(ForwardError::Undelivered(reason)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed);
                if dropped % 100 == 0 {
                    tracing::warn!("Stream {} partially undelivered: {}", self.track_id, reason);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
