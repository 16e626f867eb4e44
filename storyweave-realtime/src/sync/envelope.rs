use serde::{Deserialize, Serialize};
use storyweave_core::{now_millis, MessageKind, ParticipantId, RealtimeMessage};

/// Broadcast event carrying keep-alive pings
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Broadcast event carrying application-level errors reported by a peer
pub const EVENT_ERROR: &str = "error";

/// Shape of every broadcast this crate puts on the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub sender: ParticipantId,
    /// Epoch millis
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BroadcastEnvelope {
    /// Stamp a payload with the sender and the current time
    #[must_use]
    pub fn new(sender: ParticipantId, payload: serde_json::Value) -> Self {
        Self {
            sender,
            timestamp: now_millis(),
            payload,
        }
    }

    #[must_use]
    pub fn into_message(self, kind: MessageKind) -> RealtimeMessage {
        RealtimeMessage {
            kind,
            payload: self.payload,
            sender: self.sender,
            timestamp: self.timestamp,
        }
    }

    /// Human-readable text of a peer `error` broadcast
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.payload {
            serde_json::Value::String(message) => message.clone(),
            other => other
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| other.to_string(), str::to_string),
        }
    }
}
