use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use storyweave_core::ParticipantId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ChannelHandle, EventSender, PresenceState, RealtimeTransport, SendStatus, Subscription,
    SubscriptionStatus, TransportEvent,
};
use crate::error::{Error, Result};

/// Subscriber information
#[derive(Debug, Clone)]
struct Subscriber {
    handle_id: String,
    participant: ParticipantId,
    sender: EventSender,
}

/// Presence meta tracked by one subscription
#[derive(Debug, Clone)]
struct TrackedMeta {
    handle_id: String,
    key: String,
    meta: serde_json::Value,
}

/// In-process transport routing presence and broadcasts between subscribers
/// of the same topic. Used for single-process deployments and tests.
#[derive(Clone, Default)]
pub struct LocalHub {
    /// Map of topic -> list of subscribers
    topics: Arc<DashMap<String, Vec<Subscriber>>>,

    /// Map of handle ID -> topic for cleanup
    handles: Arc<DashMap<String, String>>,

    /// Map of topic -> tracked presence metas
    presence: Arc<DashMap<String, Vec<TrackedMeta>>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subscribers| subscribers.len())
    }

    /// Number of topics with at least one subscriber
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Current presence state of a topic
    #[must_use]
    pub fn presence_state(&self, topic: &str) -> PresenceState {
        let mut state = PresenceState::new();
        if let Some(metas) = self.presence.get(topic) {
            for tracked in metas.iter() {
                state
                    .entry(tracked.key.clone())
                    .or_default()
                    .push(tracked.meta.clone());
            }
        }
        state
    }

    /// Simulate a transport fault: every subscriber on `topic` receives a
    /// channel error and is dropped. Returns the number of subscribers hit.
    pub fn fail_topic(&self, topic: &str, reason: &str) -> usize {
        let Some((_, subscribers)) = self.topics.remove(topic) else {
            return 0;
        };
        self.presence.remove(topic);

        for subscriber in &subscribers {
            self.handles.remove(&subscriber.handle_id);
            let _ = subscriber.sender.send(TransportEvent::Status(
                SubscriptionStatus::ChannelError(reason.to_string()),
            ));
        }

        warn!(
            topic = %topic,
            subscribers = subscribers.len(),
            reason = %reason,
            "Topic failed, subscribers dropped"
        );

        subscribers.len()
    }

    fn subscriber(&self, handle: &ChannelHandle) -> Result<Subscriber> {
        let topic = self
            .handles
            .get(handle.id())
            .map(|topic| topic.clone())
            .ok_or_else(|| Error::Transport(format!("Unknown channel handle {}", handle.id())))?;

        self.topics
            .get(&topic)
            .and_then(|subscribers| {
                subscribers
                    .iter()
                    .find(|sub| sub.handle_id == handle.id())
                    .cloned()
            })
            .ok_or_else(|| {
                Error::Transport(format!("Channel handle {} not subscribed", handle.id()))
            })
    }

    /// Remove a subscription and its presence. Returns false if it was unknown.
    fn remove_handle(&self, handle_id: &str) -> bool {
        let Some((_, topic)) = self.handles.remove(handle_id) else {
            return false;
        };

        if let Some(mut subscribers) = self.topics.get_mut(&topic) {
            subscribers.retain(|sub| sub.handle_id != handle_id);

            if subscribers.is_empty() {
                drop(subscribers); // Drop the RefMut before removing
                self.topics.remove(&topic);
                debug!(topic = %topic, "Topic has no more subscribers, removed");
            }
        }

        let mut untracked = Vec::new();
        if let Some(mut metas) = self.presence.get_mut(&topic) {
            metas.retain(|tracked| {
                if tracked.handle_id == handle_id {
                    untracked.push(tracked.clone());
                    false
                } else {
                    true
                }
            });
        }

        for tracked in untracked {
            self.deliver(
                &topic,
                None,
                &TransportEvent::PresenceLeave {
                    key: tracked.key,
                    metas: vec![tracked.meta],
                },
            );
            self.sync_presence(&topic);
        }

        true
    }

    /// Deliver an event to every subscriber of a topic except `skip_handle`
    fn deliver(&self, topic: &str, skip_handle: Option<&str>, event: &TransportEvent) -> usize {
        let subscribers = self
            .topics
            .get(topic)
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default();

        let mut sent_count = 0;
        let mut failed_handles = Vec::new();

        for subscriber in subscribers {
            if Some(subscriber.handle_id.as_str()) == skip_handle {
                continue;
            }
            match subscriber.sender.send(event.clone()) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    warn!(
                        topic = %topic,
                        participant = %subscriber.participant,
                        handle_id = %subscriber.handle_id,
                        error = %err,
                        "Failed to deliver event, marking for cleanup"
                    );
                    failed_handles.push(subscriber.handle_id);
                }
            }
        }

        for handle_id in failed_handles {
            self.remove_handle(&handle_id);
        }

        debug!(
            topic = %topic,
            sent_count = sent_count,
            event_type = %event.event_type(),
            "Event delivered"
        );

        sent_count
    }

    fn sync_presence(&self, topic: &str) {
        let state = self.presence_state(topic);
        self.deliver(topic, None, &TransportEvent::PresenceSync(state));
    }
}

#[async_trait]
impl RealtimeTransport for LocalHub {
    async fn subscribe(&self, topic: &str, participant: &ParticipantId) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(topic);

        let subscriber = Subscriber {
            handle_id: handle.id().to_string(),
            participant: participant.clone(),
            sender: tx.clone(),
        };

        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
        self.handles
            .insert(handle.id().to_string(), topic.to_string());

        // Subscribed first, then the current roster
        let _ = tx.send(TransportEvent::Status(SubscriptionStatus::Subscribed));
        let _ = tx.send(TransportEvent::PresenceSync(self.presence_state(topic)));

        info!(
            topic = %topic,
            participant = %participant,
            handle_id = %handle.id(),
            "Participant subscribed to topic"
        );

        Ok(Subscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()> {
        if self.remove_handle(handle.id()) {
            info!(
                topic = %handle.topic(),
                handle_id = %handle.id(),
                "Participant unsubscribed from topic"
            );
        } else {
            debug!(
                handle_id = %handle.id(),
                "Attempted to unsubscribe unknown handle"
            );
        }
        Ok(())
    }

    async fn send(
        &self,
        handle: &ChannelHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<SendStatus> {
        self.subscriber(handle)?;

        self.deliver(
            handle.topic(),
            Some(handle.id()),
            &TransportEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
        );

        Ok(SendStatus::Ok)
    }

    async fn track(&self, handle: &ChannelHandle, meta: serde_json::Value) -> Result<SendStatus> {
        let subscriber = self.subscriber(handle)?;
        let key = subscriber.participant.as_str().to_string();

        let joined = {
            let mut metas = self.presence.entry(handle.topic().to_string()).or_default();
            match metas
                .iter()
                .position(|tracked| tracked.handle_id == subscriber.handle_id)
            {
                Some(index) => {
                    metas[index].meta = meta.clone();
                    false
                }
                None => {
                    metas.push(TrackedMeta {
                        handle_id: subscriber.handle_id.clone(),
                        key: key.clone(),
                        meta: meta.clone(),
                    });
                    true
                }
            }
        };

        if joined {
            self.deliver(
                handle.topic(),
                None,
                &TransportEvent::PresenceJoin {
                    key,
                    metas: vec![meta],
                },
            );
        }
        self.sync_presence(handle.topic());

        Ok(SendStatus::Ok)
    }
}
