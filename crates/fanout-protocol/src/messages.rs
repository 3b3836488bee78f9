use serde::{Deserialize, Serialize};

use crate::types::{Role, SdpType};

/// Kinds of messages carried on the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Publisher offer, client to relay
    #[serde(rename = "sender-sdp-offer")]
    PublisherOffer,

    /// Subscriber offer, client to relay
    #[serde(rename = "receiver-sdp-offer", alias = "reciever-sdp-offer")]
    SubscriberOffer,

    /// Publisher answer, relay to client
    #[serde(rename = "sdp-answer-sender")]
    PublisherAnswer,

    /// Subscriber answer, relay to client
    #[serde(rename = "sdp-answer-receiver", alias = "sdp-answer-reciever")]
    SubscriberAnswer,
}

impl SignalKind {
    pub fn role(self) -> Role {
        match self {
            SignalKind::PublisherOffer | SignalKind::PublisherAnswer => Role::Publisher,
            SignalKind::SubscriberOffer | SignalKind::SubscriberAnswer => Role::Subscriber,
        }
    }

    pub fn direction(self) -> SdpType {
        match self {
            SignalKind::PublisherOffer | SignalKind::SubscriberOffer => SdpType::Offer,
            SignalKind::PublisherAnswer | SignalKind::SubscriberAnswer => SdpType::Answer,
        }
    }

    /// The answer kind the relay emits for a given role
    pub fn answer_for(role: Role) -> Self {
        match role {
            Role::Publisher => SignalKind::PublisherAnswer,
            Role::Subscriber => SignalKind::SubscriberAnswer,
        }
    }
}

/// Envelope exchanged over the push channel.
///
/// `data` is a base64 encoded session description (see
/// [`SessionDescriptor::encode`](crate::SessionDescriptor::encode)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
}

impl SignalingMessage {
    pub fn new(kind: SignalKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}
