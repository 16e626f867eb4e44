//! Channel session
//!
//! One story bound to one transport subscription. The session owns the
//! subscription handle, its reconnect attempt counter and the presence this
//! participant tracks on the channel. A spawned driver task consumes the
//! transport's event stream; cancelling the session's token stops the driver,
//! including any pending reconnect delay.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use storyweave_core::{
    now_millis, MessageKind, ParticipantId, PresenceRecord, PresenceStatus, PresenceUpdate,
    RealtimeMessage, StoryId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::envelope::{BroadcastEnvelope, EVENT_ERROR, EVENT_HEARTBEAT};
use super::presence::{decode_presence_state, PresenceDirectory};
use super::reconnect::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::transport::{
    ChannelHandle, PresenceState, RealtimeTransport, SendStatus, Subscription, SubscriptionStatus,
    TransportEvent,
};

pub type PresenceCallback = Arc<dyn Fn(&StoryId, &[PresenceRecord]) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&RealtimeMessage) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Open sessions of one registry, keyed by story
pub(crate) type SessionMap = Arc<RwLock<HashMap<StoryId, Arc<ChannelSession>>>>;

/// Observers registered at connect time. Each is optional.
///
/// Callbacks run on the session's driver task with no lock held, so they may
/// call back into the registry.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_presence_change: Option<PresenceCallback>,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
}

impl SessionCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_presence_change(
        mut self,
        f: impl Fn(&StoryId, &[PresenceRecord]) + Send + Sync + 'static,
    ) -> Self {
        self.on_presence_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_message(mut self, f: impl Fn(&RealtimeMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    fn presence_changed(&self, story_id: &StoryId, records: &[PresenceRecord]) {
        if let Some(cb) = &self.on_presence_change {
            cb(story_id, records);
        }
    }

    fn message(&self, message: &RealtimeMessage) {
        if let Some(cb) = &self.on_message {
            cb(message);
        }
    }

    fn error(&self, error: &Error) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_presence_change", &self.on_presence_change.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet subscribed
    Idle,
    Subscribing,
    Connected,
    /// Transport reported a failure; a reconnect decision is pending
    Error,
    /// Waiting out a backoff delay before resubscribing
    Reconnecting,
    /// Retries exhausted. Only a manual connect restarts the session.
    Failed,
    /// Torn down on request. Terminal.
    Disconnected,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session borrows from its registry
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub transport: Arc<dyn RealtimeTransport>,
    pub directory: PresenceDirectory,
    pub policy: ReconnectPolicy,
    pub topic_prefix: String,
    /// Presence this participant starts out tracking
    pub presence: PresenceRecord,
}

struct SessionInner {
    state: SessionState,
    attempts: u32,
    handle: Option<ChannelHandle>,
    own_presence: PresenceRecord,
}

/// Why the listen loop stopped
enum ListenExit {
    /// Intentional teardown; no error, no retry
    Cancelled,
    /// Transport failure; feeds the reconnect policy
    Failed(Error),
}

/// One open logical connection to one story's collaboration channel
pub struct ChannelSession {
    story_id: StoryId,
    topic: String,
    participant: ParticipantId,
    transport: Arc<dyn RealtimeTransport>,
    directory: PresenceDirectory,
    policy: ReconnectPolicy,
    callbacks: Mutex<SessionCallbacks>,
    inner: Mutex<SessionInner>,
    cancel_token: CancellationToken,
}

impl ChannelSession {
    pub(crate) fn new(
        story_id: StoryId,
        context: SessionContext,
        callbacks: SessionCallbacks,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let topic = format!("{}{}", context.topic_prefix, story_id);
        Arc::new(Self {
            story_id,
            topic,
            participant: context.presence.user_id.clone(),
            transport: context.transport,
            directory: context.directory,
            policy: context.policy,
            callbacks: Mutex::new(callbacks),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                attempts: 0,
                handle: None,
                own_presence: context.presence,
            }),
            cancel_token,
        })
    }

    #[must_use]
    pub fn story_id(&self) -> &StoryId {
        &self.story_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Consecutive failed subscriptions since the last successful one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Presence record this participant tracks on the channel
    #[must_use]
    pub fn own_presence(&self) -> PresenceRecord {
        self.inner.lock().own_presence.clone()
    }

    /// Spawn the driver task
    pub(crate) fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run().await;
        });
    }

    /// Restart a failed session from `Idle` with a fresh set of callbacks.
    /// Returns false, keeping the current callbacks, for any other state.
    pub(crate) fn restart(self: &Arc<Self>, callbacks: SessionCallbacks) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Failed {
                return false;
            }
            inner.state = SessionState::Idle;
            inner.attempts = 0;
            *self.callbacks.lock() = callbacks;
        }
        self.start();
        true
    }

    /// Put a session that never started straight into `Failed`.
    ///
    /// The error reaches `on_error` from a spawned task, never from the
    /// caller's stack.
    pub(crate) fn mark_failed(&self, error: Error) {
        self.inner.lock().state = SessionState::Failed;
        let callbacks = self.callbacks();
        tokio::spawn(async move {
            callbacks.error(&error);
        });
    }

    /// Tear the session down: stop the driver, release the transport handle
    /// and forget the story's presence. Never reports an error.
    pub(crate) async fn shutdown(&self) {
        self.cancel_token.cancel();

        let (previous, handle) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = SessionState::Disconnected;
            (previous, inner.handle.take())
        };

        if let Some(handle) = handle {
            self.release(&handle).await;
        }
        self.directory.remove_story(&self.story_id);

        info!(
            story_id = %self.story_id,
            previous_state = %previous,
            "Channel session disconnected"
        );
    }

    /// Broadcast an event of `kind` wrapped in a sender/timestamp envelope
    pub async fn broadcast(
        &self,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<SendStatus> {
        self.send_envelope(kind.event_name(), payload).await
    }

    /// Merge a partial presence into this participant's record and track it.
    ///
    /// The merge is kept even when the channel is down; it is tracked again on
    /// the next successful subscription.
    pub async fn update_presence(&self, update: &PresenceUpdate) -> Result<SendStatus> {
        let (handle, meta) = {
            let mut inner = self.inner.lock();
            inner.own_presence.apply(update);
            inner.own_presence.last_seen = Some(now_millis());
            let handle = match (&inner.state, &inner.handle) {
                (SessionState::Connected, Some(handle)) => handle.clone(),
                _ => return Err(Error::NotConnected(self.story_id.clone())),
            };
            (handle, serde_json::to_value(&inner.own_presence)?)
        };

        self.transport.track(&handle, meta).await
    }

    pub(crate) async fn send_heartbeat(&self) -> Result<SendStatus> {
        self.send_envelope(EVENT_HEARTBEAT, serde_json::json!({})).await
    }

    async fn send_envelope(&self, event: &str, payload: serde_json::Value) -> Result<SendStatus> {
        let handle = self.connected_handle()?;
        let envelope = BroadcastEnvelope::new(self.participant.clone(), payload);
        let payload = serde_json::to_value(&envelope)?;
        self.transport.send(&handle, event, payload).await
    }

    fn connected_handle(&self) -> Result<ChannelHandle> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.handle) {
            (SessionState::Connected, Some(handle)) => Ok(handle.clone()),
            _ => Err(Error::NotConnected(self.story_id.clone())),
        }
    }

    /// Move to `to` unless the session was torn down meanwhile
    fn transition(&self, to: SessionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return false;
        }
        if inner.state != to {
            debug!(
                story_id = %self.story_id,
                from = %inner.state,
                to = %to,
                "Channel session state change"
            );
            inner.state = to;
        }
        true
    }

    fn callbacks(&self) -> SessionCallbacks {
        self.callbacks.lock().clone()
    }

    /// Driver exit on cancellation. When the owning registry was dropped
    /// nobody else holds the handle, so it is released here.
    async fn release_on_cancel(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Disconnected;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            self.release(&handle).await;
        }
    }

    async fn release(&self, handle: &ChannelHandle) {
        if let Err(e) = self.transport.unsubscribe(handle).await {
            warn!(
                story_id = %self.story_id,
                handle_id = %handle.id(),
                error = %e,
                "Failed to unsubscribe channel handle"
            );
        }
    }

    /// Driver: subscribe, listen, and on failure back off and resubscribe
    /// until the policy gives up or the session is cancelled.
    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel_token.is_cancelled() || !self.transition(SessionState::Subscribing) {
                return;
            }

            let error = match self.subscribe_and_listen().await {
                ListenExit::Cancelled => {
                    self.release_on_cancel().await;
                    return;
                }
                ListenExit::Failed(error) => error,
            };

            let (attempt, stale) = {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Disconnected {
                    return;
                }
                inner.state = SessionState::Error;
                inner.attempts += 1;
                (inner.attempts, inner.handle.take())
            };

            warn!(
                story_id = %self.story_id,
                attempt = attempt,
                error = %error,
                "Channel subscription failed"
            );
            self.callbacks().error(&error);

            if let Some(handle) = stale {
                self.release(&handle).await;
            }

            let Some(delay) = self.policy.next_delay(attempt) else {
                if !self.transition(SessionState::Failed) {
                    return;
                }
                error!(
                    story_id = %self.story_id,
                    max_attempts = self.policy.max_attempts,
                    "Reconnect attempts exhausted, channel marked failed"
                );
                self.callbacks().error(&Error::RetriesExhausted {
                    story_id: self.story_id.clone(),
                    attempts: self.policy.max_attempts,
                });
                return;
            };

            if !self.transition(SessionState::Reconnecting) {
                return;
            }

            warn!(
                story_id = %self.story_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling channel reconnect"
            );

            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => {
                    debug!(story_id = %self.story_id, "Pending reconnect cancelled");
                    self.release_on_cancel().await;
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn subscribe_and_listen(&self) -> ListenExit {
        let subscribed = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => return ListenExit::Cancelled,
            result = self.transport.subscribe(&self.topic, &self.participant) => result,
        };

        let Subscription { handle, mut events } = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => return ListenExit::Failed(e),
        };

        // Teardown may have raced the subscribe call
        let torn_down = {
            let mut inner = self.inner.lock();
            if self.cancel_token.is_cancelled() || inner.state == SessionState::Disconnected {
                true
            } else {
                inner.handle = Some(handle.clone());
                false
            }
        };
        if torn_down {
            self.release(&handle).await;
            return ListenExit::Cancelled;
        }

        debug!(
            story_id = %self.story_id,
            topic = %self.topic,
            handle_id = %handle.id(),
            "Channel subscribe issued"
        );

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return ListenExit::Cancelled,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                return ListenExit::Failed(Error::ChannelClosed {
                    story_id: self.story_id.clone(),
                });
            };

            if let Err(error) = self.handle_event(&handle, event).await {
                return ListenExit::Failed(error);
            }
        }
    }

    /// Route one transport event. `Err` means the subscription is lost.
    async fn handle_event(&self, handle: &ChannelHandle, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Status(SubscriptionStatus::Subscribed) => {
                self.on_subscribed(handle).await;
                Ok(())
            }
            TransportEvent::Status(SubscriptionStatus::ChannelError(reason)) => {
                Err(Error::ChannelError {
                    story_id: self.story_id.clone(),
                    reason,
                })
            }
            TransportEvent::Status(SubscriptionStatus::TimedOut) => Err(Error::TimedOut {
                story_id: self.story_id.clone(),
            }),
            TransportEvent::Status(SubscriptionStatus::Closed) => Err(Error::ChannelClosed {
                story_id: self.story_id.clone(),
            }),
            TransportEvent::PresenceSync(state) => {
                self.apply_presence_sync(&state);
                Ok(())
            }
            TransportEvent::PresenceJoin { key, metas } => {
                debug!(
                    story_id = %self.story_id,
                    key = %key,
                    metas = metas.len(),
                    "Presence join"
                );
                Ok(())
            }
            TransportEvent::PresenceLeave { key, metas } => {
                debug!(
                    story_id = %self.story_id,
                    key = %key,
                    metas = metas.len(),
                    "Presence leave"
                );
                Ok(())
            }
            TransportEvent::Broadcast { event, payload } => {
                if self.is_connected() {
                    self.route_broadcast(&event, payload);
                } else {
                    debug!(
                        story_id = %self.story_id,
                        event = %event,
                        "Dropping broadcast received while not connected"
                    );
                }
                Ok(())
            }
        }
    }

    async fn on_subscribed(&self, handle: &ChannelHandle) {
        let meta = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Connected;
            inner.attempts = 0;
            inner.own_presence.status = PresenceStatus::Online;
            inner.own_presence.last_seen = Some(now_millis());
            serde_json::to_value(&inner.own_presence)
        };

        info!(story_id = %self.story_id, topic = %self.topic, "Channel subscribed");

        let result = match meta {
            Ok(meta) => self.transport.track(handle, meta).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(SendStatus::Ok) => {}
            Ok(status) => warn!(
                story_id = %self.story_id,
                status = ?status,
                "Own presence not acknowledged"
            ),
            Err(e) => warn!(
                story_id = %self.story_id,
                error = %e,
                "Failed to track own presence"
            ),
        }
    }

    fn apply_presence_sync(&self, state: &PresenceState) {
        let decoded = decode_presence_state(state);

        let records = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                debug!(
                    story_id = %self.story_id,
                    "Dropping presence sync received while not connected"
                );
                return;
            }
            // Replace under the session lock so a concurrent teardown cannot
            // be followed by a stale roster.
            self.directory.replace_story(&self.story_id, decoded.records);
            self.directory.story_records(&self.story_id)
        };

        if !decoded.rejected.is_empty() {
            warn!(
                story_id = %self.story_id,
                rejected = ?decoded.rejected,
                "Presence sync contained undecodable metas"
            );
            self.callbacks().error(&Error::MalformedPayload {
                story_id: self.story_id.clone(),
                event: "presence_sync".to_string(),
                reason: format!("undecodable presence for {}", decoded.rejected.join(", ")),
            });
        }

        self.callbacks().presence_changed(&self.story_id, &records);
    }

    fn route_broadcast(&self, event: &str, payload: serde_json::Value) {
        if event == EVENT_HEARTBEAT {
            trace!(story_id = %self.story_id, "Heartbeat received");
            return;
        }

        let kind = MessageKind::from_event_name(event);
        if kind.is_none() && event != EVENT_ERROR {
            debug!(story_id = %self.story_id, event = %event, "Ignoring unknown broadcast event");
            return;
        }

        let envelope = match serde_json::from_value::<BroadcastEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    story_id = %self.story_id,
                    event = %event,
                    error = %e,
                    "Malformed broadcast payload"
                );
                self.callbacks().error(&Error::MalformedPayload {
                    story_id: self.story_id.clone(),
                    event: event.to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        match kind {
            Some(kind) => self.callbacks().message(&envelope.into_message(kind)),
            None => {
                let message = envelope.error_message();
                info!(
                    story_id = %self.story_id,
                    sender = %envelope.sender,
                    message = %message,
                    "Peer reported error"
                );
                self.callbacks().error(&Error::Peer {
                    story_id: self.story_id.clone(),
                    message,
                });
            }
        }
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelSession")
            .field("story_id", &self.story_id)
            .field("topic", &self.topic)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .finish_non_exhaustive()
    }
}
