//! Outbound side of the relay
//!
//! Every subscriber offer gets its own transport session bound to the
//! shared media stream. Sessions live in a registry keyed by id, each with
//! an explicit state, so one subscriber failing or leaving never touches
//! another.

use super::publish::StreamHandle;
use crate::negotiator::{NegotiationError, Negotiator};
use crate::transport::{FeedbackReader, PACKET_BUFFER_SIZE, TransportSession};
use chrono::{DateTime, Utc};
use fanout_protocol::{Role, SessionDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SubscriberId = Uuid;

/// Failed admissions kept for status reporting; older ones are evicted
pub const MAX_FAILED_ENTRIES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SubscriberState {
    Negotiating,
    Active,
    Closed,
    Failed(String),
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberState::Negotiating => write!(f, "negotiating"),
            SubscriberState::Active => write!(f, "active"),
            SubscriberState::Closed => write!(f, "closed"),
            SubscriberState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    #[serde(flatten)]
    pub state: SubscriberState,
    pub admitted_at: DateTime<Utc>,
}

struct SubscriberEntry<S> {
    state: SubscriberState,
    session: Option<Arc<S>>,
    admitted_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum AdmitError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("subscriber {0} was closed during negotiation")]
    ClosedDuringNegotiation(SubscriberId),
}

pub struct SubscriberPool<N: Negotiator> {
    negotiator: Arc<N>,
    entries: RwLock<HashMap<SubscriberId, SubscriberEntry<N::Session>>>,
}

impl<N: Negotiator> SubscriberPool<N> {
    pub fn new(negotiator: Arc<N>) -> Self {
        Self {
            negotiator,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Negotiate a new outbound session carrying `handle`.
    ///
    /// Each call is an independent session, identical offers included.
    pub async fn admit(
        self: &Arc<Self>,
        offer: &SessionDescriptor,
        handle: &Arc<StreamHandle<N::Session>>,
    ) -> Result<(SubscriberId, SessionDescriptor), AdmitError> {
        let id = Uuid::new_v4();
        self.entries.write().await.insert(
            id,
            SubscriberEntry {
                state: SubscriberState::Negotiating,
                session: None,
                admitted_at: Utc::now(),
            },
        );

        tracing::info!("Admitting subscriber {}", id);

        let (session, feedback, answer) = match self.establish(id, offer, handle).await {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!("Subscriber {} failed: {}", id, e);
                self.record_failure(id, e.to_string()).await;
                return Err(e.into());
            }
        };

        let activated = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&id) {
                Some(entry) if entry.state == SubscriberState::Negotiating => {
                    entry.state = SubscriberState::Active;
                    entry.session = Some(Arc::clone(&session));
                    true
                }
                _ => false,
            }
        };

        if !activated {
            close_session(id, &*session).await;
            return Err(AdmitError::ClosedDuringNegotiation(id));
        }

        tokio::spawn(Arc::clone(self).supervise(id, session, feedback));

        tracing::info!(
            "Subscriber {} active on stream {}",
            id,
            handle.track_id()
        );

        Ok((id, answer))
    }

    async fn establish(
        &self,
        id: SubscriberId,
        offer: &SessionDescriptor,
        handle: &Arc<StreamHandle<N::Session>>,
    ) -> Result<
        (
            Arc<N::Session>,
            <N::Session as TransportSession>::Feedback,
            SessionDescriptor,
        ),
        NegotiationError,
    > {
        let session = self.negotiator.open(Role::Subscriber).await?;

        let feedback = match session.add_outbound(handle.sink()).await {
            Ok(feedback) => feedback,
            Err(e) => {
                close_session(id, &*session).await;
                return Err(NegotiationError::AttachStream(e));
            }
        };

        let answer = self
            .negotiator
            .answer(Role::Subscriber, &session, offer)
            .await?;

        Ok((session, feedback, answer))
    }

    /// Drain feedback until the session goes away, then release it
    async fn supervise(
        self: Arc<Self>,
        id: SubscriberId,
        session: Arc<N::Session>,
        mut feedback: <N::Session as TransportSession>::Feedback,
    ) {
        let drain = async {
            let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
            while feedback.read(&mut buf).await.is_ok() {}
        };

        tokio::select! {
            _ = drain => tracing::debug!("Feedback drain for subscriber {} ended", id),
            _ = session.closed() => tracing::debug!("Transport for subscriber {} closed", id),
        }

        self.release(id).await;
    }

    /// Tear down one subscriber. Returns false if it was unknown or already gone.
    pub async fn close(&self, id: SubscriberId) -> bool {
        let session = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&id) {
                Some(entry) if entry.state == SubscriberState::Negotiating => {
                    // admit() sees this and closes the session it built
                    entry.state = SubscriberState::Closed;
                    None
                }
                Some(entry) if entry.state == SubscriberState::Active => {
                    entry.state = SubscriberState::Closed;
                    entry.session.take()
                }
                _ => return false,
            }
        };

        if let Some(session) = session {
            close_session(id, &*session).await;
        }
        self.entries.write().await.remove(&id);

        tracing::info!("Closed subscriber {}", id);
        true
    }

    /// Tear down every subscriber
    pub async fn close_all(&self) {
        let ids: Vec<SubscriberId> = self.entries.read().await.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
    }

    async fn release(&self, id: SubscriberId) {
        let entry = self.entries.write().await.remove(&id);
        if let Some(SubscriberEntry {
            session: Some(session),
            ..
        }) = entry
        {
            close_session(id, &*session).await;
            tracing::info!("Released subscriber {}", id);
        }
    }

    /// Mark `id` as failed, keeping only the newest `MAX_FAILED_ENTRIES` failures
    async fn record_failure(&self, id: SubscriberId, reason: String) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) => entry.state = SubscriberState::Failed(reason),
            None => return,
        }

        let mut failed: Vec<(DateTime<Utc>, SubscriberId)> = entries
            .iter()
            .filter(|(_, e)| matches!(e.state, SubscriberState::Failed(_)))
            .map(|(id, e)| (e.admitted_at, *id))
            .collect();
        if failed.len() <= MAX_FAILED_ENTRIES {
            return;
        }

        failed.sort();
        let excess = failed.len() - MAX_FAILED_ENTRIES;
        for (_, stale) in failed.into_iter().take(excess) {
            entries.remove(&stale);
        }
        tracing::debug!("Evicted {} failed subscriber entries", excess);
    }

    pub async fn state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.entries.read().await.get(&id).map(|e| e.state.clone())
    }

    pub async fn list(&self) -> Vec<SubscriberInfo> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| SubscriberInfo {
                id: *id,
                state: entry.state.clone(),
                admitted_at: entry.admitted_at,
            })
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.state == SubscriberState::Active)
            .count()
    }
}

async fn close_session<S: TransportSession>(id: SubscriberId, session: &S) {
    if let Err(e) = session.close().await {
        tracing::warn!("Error closing session for subscriber {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::GatherCompleteNegotiator;
    use crate::relay::handle::MediaStreamHandle;
    use crate::transport::CodecInfo;
    use crate::transport::fake::{FakeSink, FakeTransport, REJECT_REMOTE};
    use std::time::Duration;
    use tokio::time::timeout;

    type Pool = SubscriberPool<GatherCompleteNegotiator<FakeTransport>>;

    fn setup() -> (Arc<FakeTransport>, Arc<Pool>, Arc<MediaStreamHandle<FakeSink>>) {
        let transport = FakeTransport::new();
        let negotiator = Arc::new(GatherCompleteNegotiator::new(transport.clone()));
        let pool = Arc::new(SubscriberPool::new(negotiator));
        let codec = CodecInfo {
            kind: "video".to_string(),
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
        };
        let handle = Arc::new(MediaStreamHandle::new("cam", codec, FakeSink::new("video")));
        (transport, pool, handle)
    }

    async fn wait_until_gone(pool: &Pool, id: SubscriberId) {
        timeout(Duration::from_secs(2), async {
            while pool.state(id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber was not released");
    }

    #[tokio::test]
    async fn test_admit_binds_shared_stream() {
        let (transport, pool, handle) = setup();

        let (first, a1) = pool.admit(&SessionDescriptor::offer("o2"), &handle).await.unwrap();
        let (second, a2) = pool.admit(&SessionDescriptor::offer("o3"), &handle).await.unwrap();

        assert_ne!(first, second);
        assert!(a1.sdp.starts_with("answer-to:o2"));
        assert!(a2.sdp.starts_with("answer-to:o3"));
        assert_eq!(pool.active_count().await, 2);

        let sessions = transport.sessions(Role::Subscriber);
        assert_eq!(sessions.len(), 2);
        for session in sessions {
            let outbound = session.outbound();
            assert_eq!(outbound.len(), 1);
            assert!(Arc::ptr_eq(&outbound[0], &handle.sink()));
        }
    }

    #[tokio::test]
    async fn test_identical_offers_are_independent() {
        let (transport, pool, handle) = setup();
        let offer = SessionDescriptor::offer("same");

        let (first, _) = pool.admit(&offer, &handle).await.unwrap();
        let (second, _) = pool.admit(&offer, &handle).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(transport.sessions(Role::Subscriber).len(), 2);
    }

    #[tokio::test]
    async fn test_close_one_leaves_others() {
        let (transport, pool, handle) = setup();

        let (first, _) = pool.admit(&SessionDescriptor::offer("o2"), &handle).await.unwrap();
        let (second, _) = pool.admit(&SessionDescriptor::offer("o3"), &handle).await.unwrap();

        assert!(pool.close(first).await);
        assert!(!pool.close(first).await);

        let sessions = transport.sessions(Role::Subscriber);
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
        assert_eq!(pool.state(second).await, Some(SubscriberState::Active));

        // Admission keeps working afterwards
        let (third, _) = pool.admit(&SessionDescriptor::offer("o4"), &handle).await.unwrap();
        assert_eq!(pool.state(third).await, Some(SubscriberState::Active));
        assert_eq!(pool.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_remote_disconnect_releases_subscriber() {
        let (transport, pool, handle) = setup();

        let (first, _) = pool.admit(&SessionDescriptor::offer("o2"), &handle).await.unwrap();
        let (second, _) = pool.admit(&SessionDescriptor::offer("o3"), &handle).await.unwrap();

        transport.sessions(Role::Subscriber)[0].disconnect();
        wait_until_gone(&pool, first).await;

        assert_eq!(pool.state(second).await, Some(SubscriberState::Active));
    }

    #[tokio::test]
    async fn test_failed_negotiation_is_isolated() {
        let (transport, pool, handle) = setup();

        let (good, _) = pool.admit(&SessionDescriptor::offer("o2"), &handle).await.unwrap();

        let bad_offer = SessionDescriptor::offer(format!("o3 {}", REJECT_REMOTE));
        let err = pool.admit(&bad_offer, &handle).await.unwrap_err();
        assert!(matches!(
            err,
            AdmitError::Negotiation(NegotiationError::RemoteDescription(_))
        ));

        let failed: Vec<_> = pool
            .list()
            .await
            .into_iter()
            .filter(|info| matches!(info.state, SubscriberState::Failed(_)))
            .collect();
        assert_eq!(failed.len(), 1);

        assert_eq!(pool.state(good).await, Some(SubscriberState::Active));
        assert!(!transport.sessions(Role::Subscriber)[0].is_closed());
        assert!(transport.sessions(Role::Subscriber)[1].is_closed());
    }

    #[tokio::test]
    async fn test_close_all() {
        let (transport, pool, handle) = setup();

        for i in 0..3 {
            pool.admit(&SessionDescriptor::offer(format!("o{}", i)), &handle)
                .await
                .unwrap();
        }

        pool.close_all().await;

        assert_eq!(pool.active_count().await, 0);
        assert!(transport
            .sessions(Role::Subscriber)
            .iter()
            .all(|s| s.is_closed()));
    }

    #[tokio::test]
    async fn test_failed_entries_are_bounded() {
        let (transport, pool, handle) = setup();
        let (good, _) = pool.admit(&SessionDescriptor::offer("o1"), &handle).await.unwrap();

        for i in 0..MAX_FAILED_ENTRIES + 10 {
            let offer = SessionDescriptor::offer(format!("o{} {}", i + 2, REJECT_REMOTE));
            assert!(pool.admit(&offer, &handle).await.is_err());
        }

        let list = pool.list().await;
        let failed = list
            .iter()
            .filter(|info| matches!(info.state, SubscriberState::Failed(_)))
            .count();
        assert_eq!(failed, MAX_FAILED_ENTRIES);
        assert_eq!(list.len(), MAX_FAILED_ENTRIES + 1);
        assert_eq!(pool.state(good).await, Some(SubscriberState::Active));
        assert_eq!(
            transport.sessions(Role::Subscriber).len(),
            MAX_FAILED_ENTRIES + 11
        );
    }
}
