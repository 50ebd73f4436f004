use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ==================== Client -> Server Messages ====================

/// Requests a participant sends to the broker.
///
/// `create` and `join` may carry a previously issued session id and secret to
/// resume that identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Create {
        #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(rename = "sessionSecret", default, skip_serializing_if = "Option::is_none")]
        session_secret: Option<String>,
    },
    Join {
        #[serde(rename = "roomID", default)]
        room_id: String,
        #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(rename = "sessionSecret", default, skip_serializing_if = "Option::is_none")]
        session_secret: Option<String>,
    },
    Signal {
        #[serde(rename = "peerID")]
        peer_id: String,
        data: serde_json::Value,
    },
}

impl ClientMessage {
    pub fn create(credentials: Option<&Credentials>) -> Self {
        ClientMessage::Create {
            session_id: credentials.map(|c| c.session_id.clone()),
            session_secret: credentials.map(|c| c.session_secret.clone()),
        }
    }

    pub fn join(room_id: &str, credentials: Option<&Credentials>) -> Self {
        ClientMessage::Join {
            room_id: room_id.to_string(),
            session_id: credentials.map(|c| c.session_id.clone()),
            session_secret: credentials.map(|c| c.session_secret.clone()),
        }
    }

    /// Session credentials attached to a create/join request, if complete.
    pub fn credentials(&self) -> Option<Credentials> {
        match self {
            ClientMessage::Create {
                session_id: Some(session_id),
                session_secret: Some(session_secret),
            }
            | ClientMessage::Join {
                session_id: Some(session_id),
                session_secret: Some(session_secret),
                ..
            } => Some(Credentials {
                session_id: session_id.clone(),
                session_secret: session_secret.clone(),
            }),
            _ => None,
        }
    }
}

/// A resumable identity as issued by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_id: String,
    pub session_secret: String,
}

// ==================== Server -> Client Messages ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent after every `new_peer` notice belonging to the same join.
    Joined {
        #[serde(rename = "roomID")]
        room_id: String,
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "sessionSecret")]
        session_secret: String,
    },
    NewPeer {
        #[serde(rename = "peerID")]
        peer_id: String,
        initiator: bool,
    },
    Signal {
        #[serde(rename = "peerID")]
        peer_id: String,
        data: serde_json::Value,
    },
    Error {
        error: ProtocolError,
    },
}

impl ServerMessage {
    pub fn error(error: ProtocolError) -> Self {
        ServerMessage::Error { error }
    }
}

/// Message types enum for matching
pub mod msg_types {
    pub const CREATE: &str = "create";
    pub const JOIN: &str = "join";
    pub const SIGNAL: &str = "signal";

    // Server -> Client
    pub const JOINED: &str = "joined";
    pub const NEW_PEER: &str = "new_peer";
    pub const ERROR: &str = "error";

    pub fn is_client_request(msg_type: &str) -> bool {
        matches!(msg_type, CREATE | JOIN | SIGNAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_with_credentials() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "join",
            "roomID": "r1xx",
            "sessionID": "A1",
            "sessionSecret": "sA"
        }))
        .unwrap();

        assert_eq!(
            msg.credentials(),
            Some(Credentials {
                session_id: "A1".into(),
                session_secret: "sA".into()
            })
        );
        assert!(matches!(msg, ClientMessage::Join { ref room_id, .. } if room_id == "r1xx"));
    }

    #[test]
    fn test_decode_bare_create_and_partial_credentials() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "create"})).unwrap();
        assert_eq!(msg.credentials(), None);

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "create", "sessionID": "A1"})).unwrap();
        assert_eq!(msg.credentials(), None);
    }

    #[test]
    fn test_join_without_room_id_decodes_empty() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "join"})).unwrap();
        assert!(matches!(msg, ClientMessage::Join { ref room_id, .. } if room_id.is_empty()));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let joined = serde_json::to_value(ServerMessage::Joined {
            room_id: "r1".into(),
            session_id: "A1".into(),
            session_secret: "sA".into(),
        })
        .unwrap();
        assert_eq!(
            joined,
            json!({"type": "joined", "roomID": "r1", "sessionID": "A1", "sessionSecret": "sA"})
        );

        let new_peer = serde_json::to_value(ServerMessage::NewPeer {
            peer_id: "B1".into(),
            initiator: false,
        })
        .unwrap();
        assert_eq!(
            new_peer,
            json!({"type": "new_peer", "peerID": "B1", "initiator": false})
        );

        let error = serde_json::to_value(ServerMessage::error(ProtocolError::TargetNotInRoom)).unwrap();
        assert_eq!(error, json!({"type": "error", "error": "target_not_in_room"}));
    }

    #[test]
    fn test_create_omits_missing_credentials() {
        let value = serde_json::to_value(ClientMessage::create(None)).unwrap();
        assert_eq!(value, json!({"type": "create"}));
    }
}
