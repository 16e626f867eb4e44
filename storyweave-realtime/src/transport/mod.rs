//! Transport boundary
//!
//! The channel manager never talks to a network library directly. It consumes
//! a [`RealtimeTransport`]: subscribe to a topic, get back a handle plus a
//! stream of [`TransportEvent`]s, and send broadcasts / presence through the
//! handle. Wire format is the transport's business.

pub mod local_hub;

pub use local_hub::LocalHub;

use async_trait::async_trait;
use std::collections::HashMap;
use storyweave_core::ParticipantId;
use tokio::sync::mpsc;

use crate::error::Result;

/// Full presence state of a topic: presence key -> metas (one per connection)
pub type PresenceState = HashMap<String, Vec<serde_json::Value>>;

/// Sender half of a subscription's event stream
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of a subscription's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Opaque handle to one transport subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: String,
    topic: String,
}

impl ChannelHandle {
    /// Create a handle with a fresh random ID
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(16),
            topic: topic.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Subscription status reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Events pushed by the transport for one subscription, in delivery order
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(SubscriptionStatus),
    /// Full presence snapshot; replaces whatever was known before
    PresenceSync(PresenceState),
    PresenceJoin {
        key: String,
        metas: Vec<serde_json::Value>,
    },
    PresenceLeave {
        key: String,
        metas: Vec<serde_json::Value>,
    },
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

impl TransportEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::PresenceSync(_) => "presence_sync",
            Self::PresenceJoin { .. } => "presence_join",
            Self::PresenceLeave { .. } => "presence_leave",
            Self::Broadcast { .. } => "broadcast",
        }
    }
}

/// A live subscription: the handle plus its event stream
#[derive(Debug)]
pub struct Subscription {
    pub handle: ChannelHandle,
    pub events: EventReceiver,
}

/// Outcome of a send / track call as acknowledged by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    TimedOut,
    Error,
}

/// Persistent pub/sub connection with presence and broadcast primitives.
///
/// Subscription outcome arrives asynchronously as a
/// [`TransportEvent::Status`] on the returned stream; `subscribe` itself only
/// fails when the request could not be issued at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, topic: &str, participant: &ParticipantId) -> Result<Subscription>;

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()>;

    async fn send(
        &self,
        handle: &ChannelHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<SendStatus>;

    /// Publish this connection's presence meta on the topic
    async fn track(&self, handle: &ChannelHandle, meta: serde_json::Value) -> Result<SendStatus>;
}
