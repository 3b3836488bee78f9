use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which side of the relay a session sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The single inbound session
    Publisher,
    /// One of many outbound sessions
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid session description JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session description has an empty sdp field")]
    EmptySdp,
}

/// A complete offer or answer exchanged with a remote peer.
///
/// The JSON shape matches what browsers produce from
/// `RTCPeerConnection.localDescription`: `{"type": "...", "sdp": "..."}`.
/// Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    /// Serialize to JSON and base64 encode for transport
    pub fn encode(&self) -> String {
        // Two plain string fields, serialization cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Parse a base64 encoded JSON session description.
    ///
    /// Surrounding whitespace is ignored so bodies posted with a trailing
    /// newline still decode.
    pub fn decode(encoded: &str) -> Result<Self, DecodeError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        let desc: SessionDescriptor = serde_json::from_slice(&bytes)?;

        if desc.sdp_type != SdpType::Rollback && desc.sdp.trim().is_empty() {
            return Err(DecodeError::EmptySdp);
        }

        Ok(desc)
    }
}

/// ICE server configuration handed to browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
