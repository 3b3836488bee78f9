mod ingest;
mod rtc;
mod status;

pub use ingest::ACK;

use crate::negotiator::Negotiator;
use crate::signaling;
use crate::state::AppState;
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router<N: Negotiator>(state: AppState<N>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Offer ingest
        .route("/", post(ingest::ingest_offer::<N>))
        .route("/sdp", post(ingest::ingest_offer::<N>))
        // Relay status
        .route("/api/status", get(status::get_status::<N>))
        .route("/api/subscribers/{id}", delete(status::close_subscriber::<N>))
        // WebRTC configuration
        .route("/api/rtc/ice-servers", get(rtc::get_ice_servers::<N>))
        // Push channel
        .route("/ws", get(signaling::handler::ws_handler::<N>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::GatherCompleteNegotiator;
    use crate::relay::{RelayCoordinator, RelayState};
    use crate::signaling::SignalingHub;
    use crate::state::Config;
    use crate::transport::fake::FakeTransport;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use fanout_protocol::SessionDescriptor;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn setup() -> (AppState<GatherCompleteNegotiator<FakeTransport>>, Router) {
        let negotiator = Arc::new(GatherCompleteNegotiator::new(FakeTransport::new()));
        let relay = RelayCoordinator::new(negotiator, Arc::new(SignalingHub::new()));
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
        };
        let state = AppState::new(config, relay);
        let router = create_router(state.clone());
        (state, router)
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_offer(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, router) = setup();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn test_ingest_acknowledges_offer() {
        let (state, router) = setup();
        let offer = SessionDescriptor::offer("o1").encode();

        let response = router.oneshot(post_offer("/", offer)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, ACK);
        assert_ne!(state.relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_payload() {
        let (state, router) = setup();

        let response = router
            .oneshot(post_offer("/sdp", "!!not-base64!!".to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("base64"));
        assert_eq!(state.relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_conflicts() {
        let (state, router) = setup();
        state
            .relay
            .shutdown(crate::relay::ShutdownCause::Requested)
            .await;

        let offer = SessionDescriptor::offer("o1").encode();
        let response = router.oneshot(post_offer("/", offer)).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_status_reports_idle_relay() {
        let (_, router) = setup();
        let response = router
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["state"], "idle");
        assert_eq!(body["active_subscribers"], 0);
        assert!(body.get("stream").is_none());
    }

    #[tokio::test]
    async fn test_close_unknown_subscriber() {
        let (_, router) = setup();
        let uri = format!("/api/subscribers/{}", uuid::Uuid::new_v4());
        let response = router
            .oneshot(Request::delete(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ice_servers() {
        let (_, router) = setup();
        let response = router
            .oneshot(Request::get("/api/rtc/ice-servers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body["ice_servers"][0]["urls"][0],
            "stun:stun.example.org:3478"
        );
    }
}
