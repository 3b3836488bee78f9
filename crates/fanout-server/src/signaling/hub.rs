use fanout_protocol::SignalingMessage;
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// Messages kept while no push channel is attached
pub const MAX_BACKLOG: usize = 32;

/// What happened to an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

struct ActiveChannel {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

/// The push channel the relay answers on.
///
/// Holds at most one attached connection; the newest one wins. While none
/// is attached, outbound messages queue (bounded, oldest dropped) and are
/// flushed to the next connection that attaches.
pub struct SignalingHub {
    active: RwLock<Option<ActiveChannel>>,
    backlog: Mutex<VecDeque<String>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn attach(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        let mut active = self.active.write().await;

        if let Some(previous) = active.as_ref() {
            tracing::info!(
                "Push channel {} replaces {}",
                connection_id,
                previous.connection_id
            );
        }

        let mut backlog = self.backlog.lock().await;
        if !backlog.is_empty() {
            tracing::info!(
                "Flushing {} queued messages to push channel {}",
                backlog.len(),
                connection_id
            );
        }
        while let Some(json) = backlog.pop_front() {
            if let Err(e) = sender.send(json) {
                tracing::error!("Failed to flush message to {}: {}", connection_id, e);
                backlog.push_front(e.0);
                // The new connection is already gone and the previous one was replaced
                *active = None;
                return;
            }
        }

        *active = Some(ActiveChannel {
            connection_id,
            sender,
        });
    }

    /// Detach `connection_id` if it is still the active channel
    pub async fn detach(&self, connection_id: Uuid) {
        let mut active = self.active.write().await;
        if active
            .as_ref()
            .is_some_and(|a| a.connection_id == connection_id)
        {
            *active = None;
            tracing::debug!("Push channel {} detached", connection_id);
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.active.read().await.is_some()
    }

    pub async fn send(&self, message: &SignalingMessage) -> Delivery {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return Delivery::Queued;
            }
        };

        let active = self.active.read().await;
        let json = match active.as_ref() {
            Some(channel) => match channel.sender.send(json) {
                Ok(()) => return Delivery::Sent,
                Err(e) => {
                    tracing::warn!(
                        "Push channel {} is gone, queueing message",
                        channel.connection_id
                    );
                    e.0
                }
            },
            None => json,
        };

        let mut backlog = self.backlog.lock().await;
        if backlog.len() >= MAX_BACKLOG {
            backlog.pop_front();
            tracing::warn!("Signaling backlog full, dropped oldest message");
        }
        backlog.push_back(json);
        tracing::debug!("No push channel attached, {} messages queued", backlog.len());

        Delivery::Queued
    }

    pub async fn queued(&self) -> usize {
        self.backlog.lock().await.len()
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}
