use crate::negotiator::Negotiator;
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use fanout_protocol::{SdpType, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler<N: Negotiator>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<N>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<N: Negotiator>(socket: WebSocket, state: AppState<N>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Become the active push channel; queued answers are flushed into tx
    state.relay.signaling().attach(connection_id, tx).await;

    tracing::info!("Push channel {} connected", connection_id);

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = state.relay.terminated() => break,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                let message: SignalingMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message on push channel {}: {}", connection_id, e);
                        continue;
                    }
                };

                handle_signaling_message(&state, connection_id, message);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::error!("WebSocket error on push channel {}: {}", connection_id, e);
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    // Cleanup on disconnect
    state.relay.signaling().detach(connection_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Push channel {} disconnected", connection_id);
}

fn handle_signaling_message<N: Negotiator>(
    state: &AppState<N>,
    connection_id: Uuid,
    message: SignalingMessage,
) {
    if message.kind.direction() != SdpType::Offer {
        tracing::warn!(
            "Ignoring {:?} from push channel {}: only offers are accepted",
            message.kind,
            connection_id
        );
        return;
    }

    let role = message.kind.role();
    match state.relay.submit(Some(role), &message.data) {
        Ok(_) => tracing::debug!("Push channel {} submitted {} offer", connection_id, role),
        Err(e) => tracing::warn!(
            "Rejected {} offer from push channel {}: {}",
            role,
            connection_id,
            e
        ),
    }
}
