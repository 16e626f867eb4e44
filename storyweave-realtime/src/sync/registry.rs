//! Channel registry
//!
//! Entry point for the UI layer. Owns one [`ChannelSession`] per connected
//! story, the presence directory those sessions feed and the heartbeat task.
//! Every send is best effort: failures are logged and surface as `None`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use storyweave_core::{
    MessageKind, ParticipantId, PresenceRecord, PresenceUpdate, RealtimeConfig, StoryId,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heartbeat::HeartbeatScheduler;
use super::presence::{PresenceDirectory, PresenceSnapshot};
use super::reconnect::ReconnectPolicy;
use super::session::{
    ChannelSession, SessionCallbacks, SessionContext, SessionMap, SessionState,
};
use crate::error::{Error, Result};
use crate::transport::{RealtimeTransport, SendStatus};

/// What `connect_to_story` decided under the session-map lock
enum Admission {
    Existing(Arc<ChannelSession>),
    /// Failed session plus the callbacks it restarts with
    Restart(Arc<ChannelSession>, SessionCallbacks),
    Opened(Arc<ChannelSession>),
    Rejected(Arc<ChannelSession>),
}

/// Realtime channel registry for one local participant
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    policy: ReconnectPolicy,
    /// Presence every new session starts tracking
    presence: PresenceRecord,
    sessions: SessionMap,
    directory: PresenceDirectory,
    heartbeat: HeartbeatScheduler,
    cancel_token: CancellationToken,
}

impl ChannelRegistry {
    /// Create a registry and start its heartbeat.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        participant: ParticipantId,
        config: RealtimeConfig,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let heartbeat = HeartbeatScheduler::start(
            Arc::clone(&sessions),
            config.heartbeat_interval(),
            &cancel_token,
        );

        info!(
            participant = %participant,
            max_channels = config.max_channels,
            "Channel registry created"
        );

        Self {
            transport,
            policy: ReconnectPolicy::from(&config),
            config,
            presence: PresenceRecord::new(participant),
            sessions,
            directory: PresenceDirectory::new(),
            heartbeat,
            cancel_token,
        }
    }

    /// Display name announced in this participant's presence
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.presence.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.presence.user_id
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            transport: Arc::clone(&self.transport),
            directory: self.directory.clone(),
            policy: self.policy,
            topic_prefix: self.config.topic_prefix.clone(),
            presence: self.presence.clone(),
        }
    }

    /// Open (or return) the session for a story.
    ///
    /// Returns immediately; subscription proceeds in the background and its
    /// outcome reaches `callbacks`. An existing live session is returned as is
    /// and `callbacks` are dropped. A `Failed` session is restarted and
    /// `callbacks` replace the ones it was created with.
    pub fn connect_to_story(
        &self,
        story_id: StoryId,
        callbacks: SessionCallbacks,
    ) -> Arc<ChannelSession> {
        let admission = {
            let mut sessions = self.sessions.write();
            match sessions.get(&story_id).cloned() {
                Some(existing) if existing.state() == SessionState::Failed => {
                    Admission::Restart(existing, callbacks)
                }
                Some(existing) if existing.state() != SessionState::Disconnected => {
                    Admission::Existing(existing)
                }
                _ => {
                    sessions.remove(&story_id);
                    let session = ChannelSession::new(
                        story_id.clone(),
                        self.session_context(),
                        callbacks,
                        self.cancel_token.child_token(),
                    );
                    if sessions.len() >= self.config.max_channels {
                        Admission::Rejected(session)
                    } else {
                        sessions.insert(story_id.clone(), Arc::clone(&session));
                        Admission::Opened(session)
                    }
                }
            }
        };

        match admission {
            Admission::Existing(session) => {
                debug!(
                    story_id = %story_id,
                    state = %session.state(),
                    "Reusing channel session, new callbacks dropped"
                );
                session
            }
            Admission::Restart(session, callbacks) => {
                if session.restart(callbacks) {
                    info!(story_id = %story_id, "Restarting failed channel session");
                } else {
                    debug!(
                        story_id = %story_id,
                        state = %session.state(),
                        "Channel session left failed state before restart"
                    );
                }
                session
            }
            Admission::Opened(session) => {
                info!(story_id = %story_id, topic = %session.topic(), "Connecting to story");
                session.start();
                session
            }
            Admission::Rejected(session) => {
                warn!(
                    story_id = %story_id,
                    max_channels = self.config.max_channels,
                    "Channel limit reached, refusing connection"
                );
                session.mark_failed(Error::ChannelLimitReached {
                    max: self.config.max_channels,
                });
                session
            }
        }
    }

    /// Tear down a story's session. Unknown stories are a no-op.
    pub async fn disconnect_from_story(&self, story_id: &StoryId) {
        let session = self.sessions.read().get(story_id).cloned();
        let Some(session) = session else {
            debug!(story_id = %story_id, "No channel session to disconnect");
            return;
        };

        session.shutdown().await;

        let mut sessions = self.sessions.write();
        if sessions
            .get(story_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(story_id);
        }
    }

    /// Tear down every session and stop the heartbeat. Safe to repeat.
    pub async fn disconnect_all(&self) {
        self.heartbeat.stop();

        let sessions: Vec<Arc<ChannelSession>> = self.sessions.read().values().cloned().collect();
        for session in &sessions {
            session.shutdown().await;
        }

        self.sessions
            .write()
            .retain(|_, current| !sessions.iter().any(|closed| Arc::ptr_eq(closed, current)));
        self.directory.clear();

        info!(sessions = sessions.len(), "All channel sessions disconnected");
    }

    fn session_for(&self, story_id: &StoryId, operation: &str) -> Option<Arc<ChannelSession>> {
        let session = self.sessions.read().get(story_id).cloned();
        if session.is_none() {
            warn!(story_id = %story_id, operation = operation, "No channel session for story");
        }
        session
    }

    fn best_effort(
        story_id: &StoryId,
        operation: &str,
        result: Result<SendStatus>,
    ) -> Option<SendStatus> {
        match result {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(
                    story_id = %story_id,
                    operation = operation,
                    error = %e,
                    "Realtime send failed"
                );
                None
            }
        }
    }

    /// Merge `update` into this participant's presence on a story
    pub async fn update_presence(
        &self,
        story_id: &StoryId,
        update: &PresenceUpdate,
    ) -> Option<SendStatus> {
        let session = self.session_for(story_id, "update_presence")?;
        Self::best_effort(story_id, "update_presence", session.update_presence(update).await)
    }

    pub async fn send_message(
        &self,
        story_id: &StoryId,
        payload: serde_json::Value,
    ) -> Option<SendStatus> {
        self.broadcast(story_id, MessageKind::Message, payload).await
    }

    pub async fn send_cursor(
        &self,
        story_id: &StoryId,
        payload: serde_json::Value,
    ) -> Option<SendStatus> {
        self.broadcast(story_id, MessageKind::Cursor, payload).await
    }

    /// Announce typing start/stop.
    ///
    /// The typing flag is also merged into tracked presence so that peers'
    /// typing queries see it. The returned status is the broadcast's.
    pub async fn send_typing(
        &self,
        story_id: &StoryId,
        is_typing: bool,
        chapter: Option<&str>,
        section: Option<&str>,
    ) -> Option<SendStatus> {
        let session = self.session_for(story_id, "send_typing")?;

        let update = PresenceUpdate::typing(is_typing, chapter, section);
        if let Err(e) = session.update_presence(&update).await {
            debug!(story_id = %story_id, error = %e, "Typing presence not tracked");
        }

        let kind = if is_typing {
            MessageKind::Typing
        } else {
            MessageKind::TypingStop
        };
        let payload = serde_json::json!({
            "chapter_id": chapter,
            "section_id": section,
        });
        Self::best_effort(story_id, kind.event_name(), session.broadcast(kind, payload).await)
    }

    async fn broadcast(
        &self,
        story_id: &StoryId,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Option<SendStatus> {
        let session = self.session_for(story_id, kind.event_name())?;
        Self::best_effort(story_id, kind.event_name(), session.broadcast(kind, payload).await)
    }

    /// Detached copy of every known presence
    #[must_use]
    pub fn get_presences(&self) -> PresenceSnapshot {
        self.directory.snapshot()
    }

    /// Presence of one story, sorted by participant
    #[must_use]
    pub fn get_story_presences(&self, story_id: &StoryId) -> Vec<PresenceRecord> {
        self.directory.story_records(story_id)
    }

    /// Most recently seen record of a participant across all stories
    #[must_use]
    pub fn get_presence(&self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        self.directory.get(participant_id)
    }

    #[must_use]
    pub fn is_user_typing(
        &self,
        story_id: &StoryId,
        participant_id: &ParticipantId,
        chapter: Option<&str>,
    ) -> bool {
        self.directory.is_typing(story_id, participant_id, chapter)
    }

    #[must_use]
    pub fn get_typing_users(
        &self,
        story_id: &StoryId,
        chapter: Option<&str>,
    ) -> Vec<ParticipantId> {
        self.directory.typing_users(story_id, chapter)
    }

    #[must_use]
    pub fn session(&self, story_id: &StoryId) -> Option<Arc<ChannelSession>> {
        self.sessions.read().get(story_id).cloned()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        // Stops the heartbeat; each session driver releases its own handle
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{wait_until, ScriptedTransport};
    use crate::transport::{SubscriptionStatus, TransportEvent};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry(transport: &Arc<ScriptedTransport>, config: RealtimeConfig) -> ChannelRegistry {
        ChannelRegistry::new(transport.clone(), ParticipantId::from("alice"), config)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        let first = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        let second = registry.connect_to_story(story.clone(), SessionCallbacks::new());

        assert!(Arc::ptr_eq(&first, &second));
        wait_until(|| first.is_connected()).await;
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(first.topic(), "story:s1");
    }

    #[tokio::test]
    async fn test_sends_without_session_return_none() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());
        let missing = StoryId::from("missing");

        assert_eq!(registry.send_message(&missing, json!({ "text": "hi" })).await, None);
        assert_eq!(registry.send_cursor(&missing, json!({ "x": 1 })).await, None);
        assert_eq!(registry.send_typing(&missing, true, Some("c1"), None).await, None);
        assert_eq!(
            registry
                .update_presence(&missing, &PresenceUpdate::default())
                .await,
            None
        );
        assert!(transport.sent().is_empty());
        assert_eq!(transport.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_sends_before_subscribed_return_none() {
        let transport = ScriptedTransport::new();
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| transport.subscribe_calls() == 1).await;

        assert_eq!(registry.send_message(&story, json!({})).await, None);

        transport.emit(TransportEvent::Status(SubscriptionStatus::Subscribed));
        wait_until(|| registry.session(&story).is_some_and(|s| s.is_connected())).await;
        assert_eq!(
            registry.send_message(&story, json!({ "text": "hi" })).await,
            Some(SendStatus::Ok)
        );

        let sent = transport.sent_events("message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["sender"], "alice");
        assert_eq!(sent[0]["payload"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_transport_send_failure_returns_none() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        let session = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| session.is_connected()).await;

        transport.set_fail_send(true);
        assert_eq!(registry.send_cursor(&story, json!({ "x": 3 })).await, None);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_send_typing_broadcasts_and_tracks() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default()).with_display_name("Alice");
        let story = StoryId::from("s1");

        let session = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| session.is_connected()).await;

        let status = registry.send_typing(&story, true, Some("c1"), Some("sec2")).await;
        assert_eq!(status, Some(SendStatus::Ok));

        let typing = transport.sent_events("typing");
        assert_eq!(typing[0]["payload"]["chapter_id"], "c1");
        assert_eq!(typing[0]["payload"]["section_id"], "sec2");

        let tracked = transport.tracked();
        let last = tracked.last().unwrap();
        assert_eq!(last["is_typing"], true);
        assert_eq!(last["current_chapter"], "c1");
        assert_eq!(last["display_name"], "Alice");

        registry.send_typing(&story, false, Some("c1"), None).await;
        assert_eq!(transport.sent_events("typing-stop").len(), 1);
        assert_eq!(transport.tracked().last().unwrap()["is_typing"], false);
    }

    #[tokio::test]
    async fn test_presence_queries_follow_sync() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        let session = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| session.is_connected()).await;

        let mut state = crate::transport::PresenceState::new();
        state.insert(
            "user1".to_string(),
            vec![json!({ "is_typing": true, "current_chapter": "c1", "last_seen": 5 })],
        );
        state.insert(
            "user2".to_string(),
            vec![json!({ "is_typing": true, "current_chapter": "c2" })],
        );
        transport.emit(TransportEvent::PresenceSync(state));
        wait_until(|| registry.get_story_presences(&story).len() == 2).await;

        assert_eq!(
            registry.get_typing_users(&story, Some("c1")),
            vec![ParticipantId::from("user1")]
        );
        assert!(registry.is_user_typing(&story, &ParticipantId::from("user2"), Some("c2")));
        assert!(!registry.is_user_typing(&story, &ParticipantId::from("user2"), Some("c1")));
        assert_eq!(
            registry
                .get_presence(&ParticipantId::from("user1"))
                .and_then(|r| r.last_seen),
            Some(5)
        );
        assert_eq!(registry.get_presences().len(), 2);

        registry.disconnect_from_story(&story).await;
        assert!(registry.get_presences().is_empty());
        assert_eq!(registry.session_count(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);

        // Repeating is harmless
        registry.disconnect_from_story(&story).await;
    }

    #[tokio::test]
    async fn test_channel_limit_rejects_new_story() {
        let transport = ScriptedTransport::auto_subscribed();
        let config = RealtimeConfig {
            max_channels: 1,
            ..Default::default()
        };
        let registry = registry(&transport, config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.connect_to_story(StoryId::from("s1"), SessionCallbacks::new());
        let rejected = registry.connect_to_story(
            StoryId::from("s2"),
            SessionCallbacks::new().on_error(move |e| {
                let _ = tx.send(e.clone());
            }),
        );

        assert_eq!(rejected.state(), SessionState::Failed);
        // Delivered from a spawned task, not from inside the connect call
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            rx.recv().await,
            Some(Error::ChannelLimitReached { max: 1 })
        ));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.session(&StoryId::from("s2")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_restarts_failed_session() {
        let transport = ScriptedTransport::auto_subscribed();
        transport.set_fail_subscribe(true);
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        let session = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| session.state() == SessionState::Failed).await;
        assert_eq!(transport.subscribe_calls(), 6);

        transport.set_fail_subscribe(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let again = registry.connect_to_story(
            story.clone(),
            SessionCallbacks::new().on_presence_change(move |_, records| {
                let _ = tx.send(records.len());
            }),
        );

        assert!(Arc::ptr_eq(&session, &again));
        wait_until(|| again.is_connected()).await;
        assert_eq!(transport.subscribe_calls(), 7);
        assert_eq!(again.attempts(), 0);

        let mut state = crate::transport::PresenceState::new();
        state.insert("alice".to_string(), vec![json!({ "user_id": "alice" })]);
        transport.emit(TransportEvent::PresenceSync(state));
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let transport = ScriptedTransport::new();
        transport.set_fail_subscribe(true);
        let registry = registry(&transport, RealtimeConfig::default());
        let story = StoryId::from("s1");

        let session = registry.connect_to_story(story.clone(), SessionCallbacks::new());
        wait_until(|| session.state() == SessionState::Reconnecting).await;

        registry.disconnect_from_story(&story).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_cancels_pending_retry() {
        let transport = ScriptedTransport::new();
        transport.set_fail_subscribe(true);
        let registry = registry(&transport, RealtimeConfig::default());

        let s1 = registry.connect_to_story(StoryId::from("s1"), SessionCallbacks::new());
        let s2 = registry.connect_to_story(StoryId::from("s2"), SessionCallbacks::new());
        wait_until(|| {
            s1.state() == SessionState::Reconnecting && s2.state() == SessionState::Reconnecting
        })
        .await;
        assert_eq!(transport.subscribe_calls(), 2);

        registry.disconnect_all().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.subscribe_calls(), 2);
        assert_eq!(s1.state(), SessionState::Disconnected);
        assert_eq!(s2.state(), SessionState::Disconnected);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reaches_connected_sessions() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());

        let session = registry.connect_to_story(StoryId::from("s1"), SessionCallbacks::new());
        wait_until(|| session.is_connected()).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_until(|| transport.sent_events("heartbeat").len() == 1).await;
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_all_is_idempotent() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());

        let s1 = registry.connect_to_story(StoryId::from("s1"), SessionCallbacks::new());
        let s2 = registry.connect_to_story(StoryId::from("s2"), SessionCallbacks::new());
        wait_until(|| s1.is_connected() && s2.is_connected()).await;

        registry.disconnect_all().await;

        assert_eq!(registry.session_count(), 0);
        assert!(!registry.is_heartbeat_running());
        assert_eq!(s1.state(), SessionState::Disconnected);
        assert_eq!(s2.state(), SessionState::Disconnected);
        assert_eq!(transport.unsubscribed().len(), 2);
        assert_eq!(transport.open_subscriptions(), 0);

        registry.disconnect_all().await;
        assert_eq!(transport.unsubscribed().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_releases_subscriptions() {
        let transport = ScriptedTransport::auto_subscribed();
        let registry = registry(&transport, RealtimeConfig::default());

        let s1 = registry.connect_to_story(StoryId::from("s1"), SessionCallbacks::new());
        let s2 = registry.connect_to_story(StoryId::from("s2"), SessionCallbacks::new());
        wait_until(|| s1.is_connected() && s2.is_connected()).await;
        assert_eq!(transport.open_subscriptions(), 2);

        drop(registry);

        wait_until(|| transport.open_subscriptions() == 0).await;
        assert_eq!(transport.unsubscribed().len(), 2);
        assert_eq!(s1.state(), SessionState::Disconnected);
        assert_eq!(s2.state(), SessionState::Disconnected);
    }
}
