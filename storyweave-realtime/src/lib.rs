//! Realtime collaboration channels for StoryWeave stories
//!
//! A [`ChannelRegistry`] opens one pub/sub channel per story through a
//! [`RealtimeTransport`], keeps the presence of every participant on those
//! channels and resubscribes with exponential backoff when the transport
//! drops.

pub mod error;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use error::{Error, Result};
pub use sync::{
    ChannelRegistry, ChannelSession, PresenceDirectory, PresenceSnapshot, ReconnectPolicy,
    SessionCallbacks, SessionState,
};
pub use transport::{
    ChannelHandle, LocalHub, PresenceState, RealtimeTransport, SendStatus, Subscription,
    SubscriptionStatus, TransportEvent,
};
