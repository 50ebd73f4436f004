//! Control messages exchanged over each peer's data channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    User,
    Cast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Labels a stream id as the sender's camera/mic or its screen cast.
    Stream { id: String, kind: StreamKind },
    Activity {
        id: String,
        #[serde(rename = "audioActive")]
        audio_active: bool,
    },
}

pub mod control_types {
    pub const STREAM: &str = "stream";
    pub const ACTIVITY: &str = "activity";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Malformed control message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Malformed(err.to_string())
    }
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string(self)?)
    }

    /// `Ok(None)` for well-formed messages of a type this build does not know.
    pub fn decode(text: &str) -> Result<Option<Self>, ControlError> {
        let value: Value = serde_json::from_str(text)?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ControlError::Malformed("missing type".to_string()))?;

        match msg_type {
            control_types::STREAM | control_types::ACTIVITY => {
                Ok(Some(serde_json::from_value(value)?))
            }
            other => {
                tracing::debug!(msg_type = %other, "Ignoring unknown control message");
                Ok(None)
            }
        }
    }
}
