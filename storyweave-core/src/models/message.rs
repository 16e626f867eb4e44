use serde::{Deserialize, Serialize};

use super::id::ParticipantId;

/// Kind of an ephemeral realtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Presence,
    Message,
    Cursor,
    Typing,
    TypingStop,
}

impl MessageKind {
    /// Broadcast event name used on the transport
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Message => "message",
            Self::Cursor => "cursor",
            Self::Typing => "typing",
            Self::TypingStop => "typing-stop",
        }
    }

    /// Inverse of [`MessageKind::event_name`]
    #[must_use]
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "presence" => Some(Self::Presence),
            "message" => Some(Self::Message),
            "cursor" => Some(Self::Cursor),
            "typing" => Some(Self::Typing),
            "typing-stop" => Some(Self::TypingStop),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

/// An ephemeral event exchanged over a story channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub sender: ParticipantId,
    /// Epoch millis, stamped by the sender
    pub timestamp: i64,
}
