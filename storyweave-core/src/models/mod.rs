pub mod id;
pub mod message;
pub mod presence;

pub use id::{generate_id, ParticipantId, StoryId};
pub use message::{MessageKind, RealtimeMessage};
pub use presence::{PresenceRecord, PresenceStatus, PresenceUpdate};

/// Current wall-clock time as epoch milliseconds
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
