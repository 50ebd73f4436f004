use tokio::sync::mpsc;

use crate::ws::ServerMessage;

/// Per-socket state: which identity and room this connection currently holds.
#[derive(Debug)]
pub struct WsSessionState {
    pub conn_id: String,
    pub handle: ClientHandle,
    pub session_id: Option<String>,
    pub room_id: Option<String>,
}

impl WsSessionState {
    pub fn new(conn_id: String, handle: ClientHandle) -> Self {
        Self {
            conn_id,
            handle,
            session_id: None,
            room_id: None,
        }
    }

    pub fn is_in_room(&self) -> bool {
        self.room_id.is_some()
    }

    pub fn set_joined(&mut self, session_id: String, room_id: String) {
        self.session_id = Some(session_id);
        self.room_id = Some(room_id);
    }
}

/// Client connection handle for sending messages
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: String,
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(conn_id: String, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { conn_id, sender }
    }

    pub fn send(&self, msg: ServerMessage) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.sender.send(msg)
    }

    /// Send and log instead of failing; the socket may already be gone.
    pub fn deliver(&self, msg: ServerMessage) {
        if self.send(msg).is_err() {
            tracing::debug!(conn_id = %self.conn_id, "Dropping message for closed connection");
        }
    }
}
