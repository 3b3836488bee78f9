use crate::negotiator::NegotiationError;
use crate::relay::{ShutdownCause, SubscriberId};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fanout_protocol::{DecodeError, SdpType};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the relay core
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid session description: {0}")]
    Decode(#[from] DecodeError),

    #[error("expected an offer, got {0}")]
    NotAnOffer(SdpType),

    #[error("a publisher is already active")]
    PublisherAlreadyActive,

    #[error("relay is shutting down: {0}")]
    ShuttingDown(ShutdownCause),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("subscriber {0} was closed during negotiation")]
    SubscriberClosed(SubscriberId),

    #[error("no published stream is available")]
    StreamUnavailable,
}

/// Errors returned from HTTP handlers
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Decode(_) | RelayError::NotAnOffer(_) => AppError::BadRequest(err.to_string()),
            RelayError::PublisherAlreadyActive | RelayError::ShuttingDown(_) => {
                AppError::Conflict(err.to_string())
            }
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
