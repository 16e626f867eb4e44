//! Error types for the realtime channel manager

use storyweave_core::StoryId;
use thiserror::Error;

/// Realtime error types
///
/// Connection-level variants are never returned from registry calls; they are
/// delivered to the session's `on_error` callback instead.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error on story {story_id}: {reason}")]
    ChannelError { story_id: StoryId, reason: String },

    #[error("Subscription to story {story_id} timed out")]
    TimedOut { story_id: StoryId },

    #[error("Channel for story {story_id} closed by transport")]
    ChannelClosed { story_id: StoryId },

    #[error("Gave up reconnecting to story {story_id} after {attempts} attempts")]
    RetriesExhausted { story_id: StoryId, attempts: u32 },

    #[error("Peer reported error on story {story_id}: {message}")]
    Peer { story_id: StoryId, message: String },

    #[error("Malformed {event} payload on story {story_id}: {reason}")]
    MalformedPayload {
        story_id: StoryId,
        event: String,
        reason: String,
    },

    #[error("Channel limit reached ({max} open channels)")]
    ChannelLimitReached { max: usize },

    #[error("Story {0} is not connected")]
    NotConnected(StoryId),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, Error>;
