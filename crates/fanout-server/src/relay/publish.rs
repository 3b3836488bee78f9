//! Inbound side of the relay
//!
//! Owns the publisher's transport session. The first inbound track to
//! deliver a packet becomes the relay's media stream; every packet it
//! delivers afterwards is copied into the stream's sink.

use super::handle::{MediaStreamHandle, STREAM_ID};
use crate::negotiator::{NegotiationError, Negotiator};
use crate::transport::{InboundTrack, PACKET_BUFFER_SIZE, TransportSession};
use fanout_protocol::{Role, SessionDescriptor};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;

pub type StreamHandle<S> = MediaStreamHandle<<S as TransportSession>::Sink>;

type HandleSlot<S> = watch::Sender<Option<Arc<StreamHandle<S>>>>;

/// Reason the stream stopped for good, set by the forwarder that hit it
type FaultSlot = watch::Sender<Option<String>>;

pub struct PublishSession<S: TransportSession> {
    session: Arc<S>,
    handle: watch::Receiver<Option<Arc<StreamHandle<S>>>>,
    fault: watch::Receiver<Option<String>>,
}

impl<S: TransportSession> PublishSession<S> {
    /// Negotiate the publisher session and start accepting inbound media.
    ///
    /// Returns as soon as the answer is ready; the stream handle appears
    /// later, with the first inbound packet.
    pub async fn start<N>(
        negotiator: &N,
        offer: &SessionDescriptor,
    ) -> Result<(SessionDescriptor, Self), NegotiationError>
    where
        N: Negotiator<Session = S>,
    {
        let session = negotiator.open(Role::Publisher).await?;

        let (slot, handle) = watch::channel(None);
        let slot = Arc::new(slot);
        let (fault_slot, fault) = watch::channel(None);
        let fault_slot = Arc::new(fault_slot);

        session.on_inbound_track(Box::new(move |track| -> BoxFuture<'static, ()> {
            let slot = Arc::clone(&slot);
            let fault_slot = Arc::clone(&fault_slot);
            Box::pin(async move {
                tokio::spawn(forward_track::<S>(track, slot, fault_slot));
            })
        }));

        let answer = negotiator.answer(Role::Publisher, &session, offer).await?;

        tracing::info!("Publisher session negotiated");

        Ok((
            answer,
            Self {
                session,
                handle,
                fault,
            },
        ))
    }

    /// The stream handle, if a packet has arrived yet
    pub fn try_handle(&self) -> Option<Arc<StreamHandle<S>>> {
        self.handle.borrow().clone()
    }

    /// Wait for the stream handle.
    ///
    /// Returns `None` only if the publisher session went away before any
    /// media arrived.
    pub async fn handle(&self) -> Option<Arc<StreamHandle<S>>> {
        let mut handle = self.handle.clone();
        let ready = handle.wait_for(|h| h.is_some()).await.ok()?;
        ready.clone()
    }

    /// Resolves with the reason once forwarding into the stream has failed
    /// with anything other than a closed or partially delivering sink
    pub async fn failed(&self) -> String {
        let mut fault = self.fault.clone();
        let reason = fault
            .wait_for(|f| f.is_some())
            .await
            .ok()
            .and_then(|reason| reason.clone());
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }

    /// Resolves when the inbound transport has permanently failed or closed
    pub async fn closed(&self) {
        self.session.closed().await
    }

    pub async fn close(&self) {
        if let Err(e) = self.session.close().await {
            tracing::warn!("Error closing publisher session: {}", e);
        }
    }
}

/// Forwarding loop for one inbound track
async fn forward_track<S: TransportSession>(
    track: Arc<S::Inbound>,
    slot: Arc<HandleSlot<S>>,
    fault: Arc<FaultSlot>,
) {
    let track_id = track.id();
    let codec = track.codec();
    tracing::info!(
        "Inbound {} track {} ({}, {} Hz)",
        codec.kind,
        track_id,
        codec.mime_type,
        codec.clock_rate
    );

    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];

    let first = match track.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            tracing::info!("Inbound track {} ended before any packet: {}", track_id, e);
            return;
        }
    };

    // At most one handle, however many tracks race for it
    let mut created = false;
    slot.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        let sink = track.republish(&codec.kind, STREAM_ID);
        *current = Some(Arc::new(MediaStreamHandle::new(&track_id, codec.clone(), sink)));
        created = true;
        true
    });

    if !created {
        tracing::warn!(
            "Ignoring inbound track {}: the relay already republishes another track",
            track_id
        );
        return;
    }

    let Some(handle) = slot.borrow().clone() else {
        return;
    };

    tracing::info!(
        "Media stream {} created from inbound track {}",
        handle.track_id(),
        track_id
    );

    let mut len = first;
    loop {
        if let Err(e) = handle.forward(&buf[..len]).await {
            tracing::error!("Forwarding from track {} failed: {}", track_id, e);
            fault.send_replace(Some(format!("forwarding from track {} failed: {}", track_id, e)));
            break;
        }

        len = match track.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::info!("Inbound track {} ended: {}", track_id, e);
                break;
            }
        };
    }

    tracing::info!(
        "Stopped forwarding track {} after {} packets",
        track_id,
        handle.packets_forwarded()
    );
}
