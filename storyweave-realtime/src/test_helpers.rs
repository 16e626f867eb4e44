//! Shared test doubles for the realtime crate

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storyweave_core::ParticipantId;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{
    ChannelHandle, EventSender, RealtimeTransport, SendStatus, Subscription, SubscriptionStatus,
    TransportEvent,
};

/// Transport whose events are pushed by the test.
///
/// Every subscribe hands out a fresh stream that stays open until it is
/// unsubscribed; [`ScriptedTransport::emit`] writes to the most recent one.
#[derive(Default)]
pub struct ScriptedTransport {
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_send: AtomicBool,
    auto_subscribe: AtomicBool,
    subscriptions: Mutex<Vec<(ChannelHandle, EventSender)>>,
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    tracked: Mutex<Vec<serde_json::Value>>,
    unsubscribed: Mutex<Vec<ChannelHandle>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport that reports `Subscribed` as soon as a subscription opens
    pub fn auto_subscribed() -> Arc<Self> {
        let transport = Self::default();
        transport.auto_subscribe.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Push an event to the latest subscription
    pub fn emit(&self, event: TransportEvent) {
        if let Some((_, sender)) = self.subscriptions.lock().last() {
            let _ = sender.send(event);
        }
    }

    pub fn latest_handle(&self) -> Option<ChannelHandle> {
        self.subscriptions.lock().last().map(|(handle, _)| handle.clone())
    }

    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().clone()
    }

    pub fn sent_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn tracked(&self) -> Vec<serde_json::Value> {
        self.tracked.lock().clone()
    }

    /// Subscriptions not yet unsubscribed
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn unsubscribed(&self) -> Vec<ChannelHandle> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl RealtimeTransport for ScriptedTransport {
    async fn subscribe(&self, topic: &str, _participant: &ParticipantId) -> Result<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let handle = ChannelHandle::new(topic);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_subscribe.load(Ordering::SeqCst) {
            let _ = tx.send(TransportEvent::Status(SubscriptionStatus::Subscribed));
        }
        self.subscriptions.lock().push((handle.clone(), tx));

        Ok(Subscription {
            handle,
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()> {
        self.subscriptions.lock().retain(|(open, _)| open != handle);
        self.unsubscribed.lock().push(handle.clone());
        Ok(())
    }

    async fn send(
        &self,
        _handle: &ChannelHandle,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<SendStatus> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Transport("send failed".to_string()));
        }
        self.sent.lock().push((event.to_string(), payload));
        Ok(SendStatus::Ok)
    }

    async fn track(&self, _handle: &ChannelHandle, meta: serde_json::Value) -> Result<SendStatus> {
        self.tracked.lock().push(meta);
        Ok(SendStatus::Ok)
    }
}

/// Poll `condition` until it holds. Works with paused time.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}
