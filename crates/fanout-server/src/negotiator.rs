//! Offer/answer handshake for a single transport session

use crate::transport::{MediaTransport, TransportError, TransportSession};
use async_trait::async_trait;
use fanout_protocol::{Role, SdpType, SessionDescriptor};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("expected an offer, got {0}")]
    NotAnOffer(SdpType),

    #[error("failed to create {role} session: {source}")]
    CreateSession {
        role: Role,
        #[source]
        source: TransportError,
    },

    #[error("failed to apply remote description: {0}")]
    RemoteDescription(#[source] TransportError),

    #[error("failed to create answer: {0}")]
    CreateAnswer(#[source] TransportError),

    #[error("failed to apply local description: {0}")]
    LocalDescription(#[source] TransportError),

    #[error("failed to attach outbound stream: {0}")]
    AttachStream(#[source] TransportError),

    #[error("ICE gathering finished without a local description")]
    MissingAnswer,
}

/// Runs the offer/answer exchange against the transport.
///
/// Split in two so callers can wire the session (inbound track handlers,
/// outbound streams) between creation and answering.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    type Session: TransportSession;

    /// Create a new transport session configured for `role`
    async fn open(&self, role: Role) -> Result<Arc<Self::Session>, NegotiationError>;

    /// Apply `offer` to `session` and produce the local answer.
    ///
    /// On failure the session is closed before the error is returned.
    async fn answer(
        &self,
        role: Role,
        session: &Self::Session,
        offer: &SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiationError>;
}

/// Non-trickle negotiation: the answer is only returned once ICE gathering
/// has completed, so it carries every candidate and works with clients
/// that exchange a single SDP in each direction.
pub struct GatherCompleteNegotiator<T> {
    transport: Arc<T>,
}

impl<T: MediaTransport> GatherCompleteNegotiator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    async fn exchange(
        session: &T::Session,
        offer: &SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiationError> {
        if !offer.is_offer() {
            return Err(NegotiationError::NotAnOffer(offer.sdp_type));
        }

        session
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::RemoteDescription)?;

        let answer = session
            .create_answer()
            .await
            .map_err(NegotiationError::CreateAnswer)?;

        let gathered = session.gathering_complete().await;

        session
            .set_local_description(&answer)
            .await
            .map_err(NegotiationError::LocalDescription)?;

        gathered.await;

        session
            .local_description()
            .await
            .ok_or(NegotiationError::MissingAnswer)
    }
}

#[async_trait]
impl<T: MediaTransport> Negotiator for GatherCompleteNegotiator<T> {
    type Session = T::Session;

    async fn open(&self, role: Role) -> Result<Arc<T::Session>, NegotiationError> {
        self.transport
            .new_session(role)
            .await
            .map_err(|source| NegotiationError::CreateSession { role, source })
    }

    async fn answer(
        &self,
        role: Role,
        session: &T::Session,
        offer: &SessionDescriptor,
    ) -> Result<SessionDescriptor, NegotiationError> {
        match Self::exchange(session, offer).await {
            Ok(answer) => {
                tracing::debug!("Negotiated {} session ({} bytes of SDP)", role, answer.sdp.len());
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!("{} negotiation failed: {}", role, e);
                if let Err(close_err) = session.close().await {
                    tracing::warn!("Error closing {} session: {}", role, close_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeTransport, REJECT_REMOTE};

    #[tokio::test]
    async fn test_answer_includes_gathered_candidates() {
        let transport = FakeTransport::new();
        let negotiator = GatherCompleteNegotiator::new(transport.clone());

        let session = negotiator.open(Role::Publisher).await.unwrap();
        let answer = negotiator
            .answer(Role::Publisher, &session, &SessionDescriptor::offer("o1"))
            .await
            .unwrap();

        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answer.sdp.starts_with("answer-to:o1"));
        assert!(answer.sdp.ends_with("a=candidate:fake"));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_rejects_non_offer() {
        let transport = FakeTransport::new();
        let negotiator = GatherCompleteNegotiator::new(transport);

        let session = negotiator.open(Role::Subscriber).await.unwrap();
        let result = negotiator
            .answer(Role::Subscriber, &session, &SessionDescriptor::answer("a"))
            .await;

        assert!(matches!(result, Err(NegotiationError::NotAnOffer(SdpType::Answer))));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_failure_closes_session() {
        let transport = FakeTransport::new();
        let negotiator = GatherCompleteNegotiator::new(transport);

        let session = negotiator.open(Role::Subscriber).await.unwrap();
        let offer = SessionDescriptor::offer(format!("v=0 {}", REJECT_REMOTE));
        let result = negotiator.answer(Role::Subscriber, &session, &offer).await;

        assert!(matches!(result, Err(NegotiationError::RemoteDescription(_))));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let transport = FakeTransport::new();
        transport.fail_new_sessions(true);
        let negotiator = GatherCompleteNegotiator::new(transport);

        let result = negotiator.open(Role::Publisher).await;
        assert!(matches!(
            result,
            Err(NegotiationError::CreateSession { role: Role::Publisher, .. })
        ));
    }
}
