pub mod config;
pub mod logging;
pub mod models;

pub use config::{Config, LoggingConfig, RealtimeConfig};
pub use models::{
    now_millis, MessageKind, ParticipantId, PresenceRecord, PresenceStatus, PresenceUpdate,
    RealtimeMessage, StoryId,
};
