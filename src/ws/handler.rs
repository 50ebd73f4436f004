use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::ws::{msg_types, ClientHandle, ClientMessage, ServerMessage, WsSessionState};

/// WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();

    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    // Create message channel for sending to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = WsSessionState::new(conn_id.clone(), ClientHandle::new(conn_id.clone(), tx));

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Process incoming messages
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_message(text.as_str(), &mut session, &state).await {
                    match e {
                        AppError::Protocol(error) => {
                            tracing::debug!(conn_id = %conn_id, error = %error, "Rejected request");
                            session.handle.deliver(ServerMessage::error(error));
                        }
                        other => {
                            tracing::warn!(conn_id = %conn_id, error = %other, "Ignoring malformed message");
                        }
                    }
                }
            }
            Ok(Message::Ping(_data)) => {
                // Respond with pong automatically handled by axum
                tracing::trace!(conn_id = %conn_id, "Ping received");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    tracing::info!(
        conn_id = %conn_id,
        session_id = ?session.session_id,
        room_id = ?session.room_id,
        "WebSocket disconnected, cleaning up"
    );

    state.broker.disconnect(&session).await;

    // Cancel send task
    send_task.abort();
}

/// Handle incoming signaling message
async fn handle_message(
    text: &str,
    session: &mut WsSessionState,
    state: &AppState,
) -> Result<(), AppError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    tracing::debug!(
        msg_type = %msg_type,
        conn_id = %session.conn_id,
        "Received message"
    );

    if !msg_types::is_client_request(&msg_type) {
        // Forward compatible: no reply.
        tracing::warn!(
            msg_type = %msg_type,
            session_id = ?session.session_id,
            "Unknown message type"
        );
        return Ok(());
    }

    let msg: ClientMessage = serde_json::from_value(value)?;
    state.broker.handle(session, msg).await?;

    Ok(())
}
