//! Realtime collaboration sync
//!
//! Per-story channel sessions with presence tracking, ephemeral broadcasts
//! and automatic resubscription.

pub mod envelope;
pub mod heartbeat;
pub mod presence;
pub mod reconnect;
pub mod registry;
pub mod session;

pub use envelope::{BroadcastEnvelope, EVENT_ERROR, EVENT_HEARTBEAT};
pub use heartbeat::HeartbeatScheduler;
pub use presence::{
    decode_presence_state, DecodedPresence, PresenceDirectory, PresenceSnapshot, StoryPresence,
};
pub use reconnect::ReconnectPolicy;
pub use registry::ChannelRegistry;
pub use session::{
    ChannelSession, ErrorCallback, MessageCallback, PresenceCallback, SessionCallbacks,
    SessionState,
};
