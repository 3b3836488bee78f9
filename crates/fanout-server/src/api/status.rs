use crate::error::{AppError, Result};
use crate::negotiator::Negotiator;
use crate::relay::RelayStatus;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

pub async fn get_status<N: Negotiator>(State(state): State<AppState<N>>) -> Json<RelayStatus> {
    Json(state.relay.status().await)
}

pub async fn close_subscriber<N: Negotiator>(
    State(state): State<AppState<N>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    if state.relay.subscribers().close(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("subscriber {}", id)))
    }
}
