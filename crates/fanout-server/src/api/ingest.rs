use crate::error::Result;
use crate::negotiator::Negotiator;
use crate::state::AppState;
use axum::extract::State;

/// Fixed body returned for every accepted offer
pub const ACK: &str = "done";

/// Accept a base64 encoded offer.
///
/// The first offer becomes the publisher; every later one is a subscriber.
/// Answers are delivered on the push channel once negotiation finishes.
pub async fn ingest_offer<N: Negotiator>(
    State(state): State<AppState<N>>,
    body: String,
) -> Result<&'static str> {
    let role = state.relay.submit(None, &body)?;
    tracing::debug!("Ingested {} offer ({} bytes)", role, body.len());
    Ok(ACK)
}
