//! Relay state machine
//!
//! ```text
//! Idle -> PublisherNegotiating -> PublisherReady -> AcceptingSubscribers
//!   \__________________\___________________\______________\--> ShuttingDown
//! ```
//!
//! Subscribers are only ever admitted in `AcceptingSubscribers`, which is
//! entered once the publisher has answered and its stream handle exists.

use super::publish::{PublishSession, StreamHandle};
use super::subscribe::{AdmitError, SubscriberId, SubscriberInfo, SubscriberPool};
use crate::error::RelayError;
use crate::negotiator::Negotiator;
use crate::signaling::SignalingHub;
use fanout_protocol::{Role, SessionDescriptor, SignalKind, SignalingMessage};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Stopped from outside, e.g. process termination
    Requested,
    PublisherFailed(String),
    PublisherDisconnected,
}

impl ShutdownCause {
    /// Whether the relay stopped because it could never serve media
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownCause::PublisherFailed(_))
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Requested => write!(f, "shutdown requested"),
            ShutdownCause::PublisherFailed(reason) => write!(f, "publisher failed: {}", reason),
            ShutdownCause::PublisherDisconnected => write!(f, "publisher disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    PublisherNegotiating,
    PublisherReady,
    AcceptingSubscribers,
    ShuttingDown(ShutdownCause),
}

impl RelayState {
    fn name(&self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::PublisherNegotiating => "publisher_negotiating",
            RelayState::PublisherReady => "publisher_ready",
            RelayState::AcceptingSubscribers => "accepting_subscribers",
            RelayState::ShuttingDown(_) => "shutting_down",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::ShuttingDown(cause) => write!(f, "shutting_down ({})", cause),
            other => f.write_str(other.name()),
        }
    }
}

/// Serializable snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStatus>,
    pub active_subscribers: usize,
    pub subscribers: Vec<SubscriberInfo>,
    pub push_channel_attached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub track_id: String,
    pub source_track_id: String,
    pub mime_type: String,
    pub clock_rate: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
}

pub struct RelayCoordinator<N: Negotiator> {
    negotiator: Arc<N>,
    state: watch::Sender<RelayState>,
    publisher: RwLock<Option<Arc<PublishSession<N::Session>>>>,
    subscribers: Arc<SubscriberPool<N>>,
    signaling: Arc<SignalingHub>,
}

impl<N: Negotiator> RelayCoordinator<N> {
    pub fn new(negotiator: Arc<N>, signaling: Arc<SignalingHub>) -> Arc<Self> {
        let (state, _) = watch::channel(RelayState::Idle);
        Arc::new(Self {
            subscribers: Arc::new(SubscriberPool::new(Arc::clone(&negotiator))),
            negotiator,
            state,
            publisher: RwLock::new(None),
            signaling,
        })
    }

    pub fn state(&self) -> RelayState {
        self.state.borrow().clone()
    }

    pub fn signaling(&self) -> &Arc<SignalingHub> {
        &self.signaling
    }

    pub fn subscribers(&self) -> &Arc<SubscriberPool<N>> {
        &self.subscribers
    }

    /// Accept an encoded offer from the signaling channel.
    ///
    /// Decoding happens here, so malformed payloads are rejected before
    /// anything is negotiated. Without a role hint the first offer claims
    /// the publisher slot and every later one is a subscriber. Negotiation
    /// itself runs in the background; answers go out on the push channel.
    pub fn submit(
        self: &Arc<Self>,
        role_hint: Option<Role>,
        encoded: &str,
    ) -> Result<Role, RelayError> {
        let offer = SessionDescriptor::decode(encoded)?;
        if !offer.is_offer() {
            return Err(RelayError::NotAnOffer(offer.sdp_type));
        }

        let role = match role_hint {
            Some(Role::Publisher) => {
                self.claim_publisher()?;
                Role::Publisher
            }
            Some(Role::Subscriber) => {
                self.ensure_running()?;
                Role::Subscriber
            }
            None => match self.claim_publisher() {
                Ok(()) => Role::Publisher,
                Err(RelayError::PublisherAlreadyActive) => Role::Subscriber,
                Err(e) => return Err(e),
            },
        };

        tracing::info!("Accepted {} offer", role);

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let result = match role {
                Role::Publisher => relay.run_publish(offer).await.map(|_| ()),
                Role::Subscriber => relay.admit(&offer).await.map(|_| ()),
            };
            if let Err(e) = result {
                tracing::error!("{} negotiation failed: {}", role, e);
            }
        });

        Ok(role)
    }

    /// Negotiate the publisher session. Only valid while idle.
    pub async fn publish(
        self: &Arc<Self>,
        offer: &SessionDescriptor,
    ) -> Result<SessionDescriptor, RelayError> {
        self.claim_publisher()?;
        self.run_publish(offer.clone()).await
    }

    /// Negotiate a subscriber session against the published stream.
    ///
    /// Waits until the stream handle exists; fails if the relay shuts down
    /// first.
    pub async fn admit(
        self: &Arc<Self>,
        offer: &SessionDescriptor,
    ) -> Result<(SubscriberId, SessionDescriptor), RelayError> {
        let handle = self.stream_handle().await?;

        let (id, answer) = self
            .subscribers
            .admit(offer, &handle)
            .await
            .map_err(|e| match e {
                AdmitError::Negotiation(e) => RelayError::Negotiation(e),
                AdmitError::ClosedDuringNegotiation(id) => RelayError::SubscriberClosed(id),
            })?;

        // Lost a race with the shutdown cascade
        if let Err(e) = self.ensure_running() {
            self.subscribers.close(id).await;
            return Err(e);
        }

        self.signaling
            .send(&SignalingMessage::new(
                SignalKind::SubscriberAnswer,
                answer.encode(),
            ))
            .await;

        Ok((id, answer))
    }

    /// Stop the relay and tear down every session. Idempotent.
    pub async fn shutdown(&self, cause: ShutdownCause) {
        let mut changed = false;
        self.state.send_if_modified(|state| {
            if matches!(state, RelayState::ShuttingDown(_)) {
                return false;
            }
            *state = RelayState::ShuttingDown(cause.clone());
            changed = true;
            true
        });

        if !changed {
            return;
        }

        tracing::warn!("Relay shutting down: {}", cause);

        self.subscribers.close_all().await;

        let publisher = self.publisher.write().await.take();
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
    }

    /// Wait until the relay reaches `ShuttingDown` and return why
    pub async fn terminated(&self) -> ShutdownCause {
        let mut state = self.state.subscribe();
        loop {
            let current = state.borrow_and_update().clone();
            if let RelayState::ShuttingDown(cause) = current {
                return cause;
            }
            if state.changed().await.is_err() {
                return ShutdownCause::Requested;
            }
        }
    }

    pub async fn status(&self) -> RelayStatus {
        let state = self.state();
        let shutdown_reason = match &state {
            RelayState::ShuttingDown(cause) => Some(cause.to_string()),
            _ => None,
        };

        let handle = match self.publisher.read().await.as_ref() {
            Some(publisher) => publisher.try_handle(),
            None => None,
        };
        let stream = handle.map(|h| StreamStatus {
            track_id: h.track_id().to_string(),
            source_track_id: h.source_track_id().to_string(),
            mime_type: h.codec().mime_type.clone(),
            clock_rate: h.codec().clock_rate,
            created_at: h.created_at(),
            packets_forwarded: h.packets_forwarded(),
            packets_dropped: h.packets_dropped(),
        });

        RelayStatus {
            state: state.name().to_string(),
            shutdown_reason,
            stream,
            active_subscribers: self.subscribers.active_count().await,
            subscribers: self.subscribers.list().await,
            push_channel_attached: self.signaling.is_attached().await,
        }
    }

    fn ensure_running(&self) -> Result<(), RelayError> {
        match &*self.state.borrow() {
            RelayState::ShuttingDown(cause) => Err(RelayError::ShuttingDown(cause.clone())),
            _ => Ok(()),
        }
    }

    /// Atomically move Idle -> PublisherNegotiating
    fn claim_publisher(&self) -> Result<(), RelayError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match state {
            RelayState::Idle => {
                *state = RelayState::PublisherNegotiating;
                true
            }
            RelayState::ShuttingDown(cause) => {
                result = Err(RelayError::ShuttingDown(cause.clone()));
                false
            }
            _ => {
                result = Err(RelayError::PublisherAlreadyActive);
                false
            }
        });
        result
    }

    /// Advance from `from` to `to`, unless something else moved the state
    fn advance(&self, from: RelayState, to: RelayState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                tracing::info!("Relay state {} -> {}", state, to);
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn run_publish(
        self: &Arc<Self>,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, RelayError> {
        let (answer, publisher) = match PublishSession::start(&*self.negotiator, &offer).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!("Publisher negotiation failed: {}", e);
                self.shutdown(ShutdownCause::PublisherFailed(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        let publisher = Arc::new(publisher);
        {
            let mut slot = self.publisher.write().await;
            if let Err(e) = self.ensure_running() {
                drop(slot);
                publisher.close().await;
                return Err(e);
            }
            *slot = Some(Arc::clone(&publisher));
        }

        self.signaling
            .send(&SignalingMessage::new(
                SignalKind::PublisherAnswer,
                answer.encode(),
            ))
            .await;

        tokio::spawn(Arc::clone(self).watch_publisher(publisher));

        Ok(answer)
    }

    /// Drive the publisher through readiness, and shut the relay down when
    /// its transport goes away or its stream can no longer be fed
    async fn watch_publisher(self: Arc<Self>, publisher: Arc<PublishSession<N::Session>>) {
        tokio::select! {
            handle = publisher.handle() => {
                if handle.is_some()
                    && self.advance(RelayState::PublisherNegotiating, RelayState::PublisherReady)
                {
                    self.advance(RelayState::PublisherReady, RelayState::AcceptingSubscribers);
                }
            }
            _ = publisher.closed() => {}
            _ = self.terminated() => return,
        }

        tokio::select! {
            _ = publisher.closed() => {
                tracing::warn!("Publisher transport closed");
                self.shutdown(ShutdownCause::PublisherDisconnected).await;
            }
            reason = publisher.failed() => {
                self.shutdown(ShutdownCause::PublisherFailed(reason)).await;
            }
            _ = self.terminated() => {}
        }
    }

    async fn stream_handle(&self) -> Result<Arc<StreamHandle<N::Session>>, RelayError> {
        let mut state = self.state.subscribe();
        let ready = state
            .wait_for(|s| {
                matches!(
                    s,
                    RelayState::AcceptingSubscribers | RelayState::ShuttingDown(_)
                )
            })
            .await
            .map(|s| s.clone())
            .unwrap_or(RelayState::ShuttingDown(ShutdownCause::Requested));

        if let RelayState::ShuttingDown(cause) = ready {
            return Err(RelayError::ShuttingDown(cause));
        }

        self.publisher
            .read()
            .await
            .as_ref()
            .and_then(|p| p.try_handle())
            .ok_or(RelayError::StreamUnavailable)
    }
}
