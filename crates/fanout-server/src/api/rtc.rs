use crate::negotiator::Negotiator;
use crate::state::AppState;
use axum::{Json, extract::State};
use fanout_protocol::IceServer;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

pub async fn get_ice_servers<N: Negotiator>(
    State(state): State<AppState<N>>,
) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
}
