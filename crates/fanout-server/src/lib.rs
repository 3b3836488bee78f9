//! Fanout relay server library
//!
//! One publisher, any number of subscribers. This module exposes the server
//! components for testing and embedding.

pub mod api;
pub mod error;
pub mod negotiator;
pub mod relay;
pub mod signaling;
pub mod state;
pub mod transport;

use anyhow::Result;
use std::sync::Arc;

pub type WebRtcNegotiator = negotiator::GatherCompleteNegotiator<transport::WebRtcTransport>;
pub type WebRtcRelay = relay::RelayCoordinator<WebRtcNegotiator>;

/// Create and configure the server application
pub fn create_app(config: state::Config) -> Result<(axum::Router, Arc<WebRtcRelay>)> {
    let transport = Arc::new(transport::WebRtcTransport::new(&config.stun_servers)?);
    let negotiator = Arc::new(negotiator::GatherCompleteNegotiator::new(transport));
    let relay = relay::RelayCoordinator::new(negotiator, Arc::new(signaling::SignalingHub::new()));
    let app_state = state::AppState::new(config, Arc::clone(&relay));
    let router = api::create_router(app_state);
    Ok((router, relay))
}
