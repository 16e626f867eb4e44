//! Heartbeat scheduler
//!
//! Periodically broadcasts a keep-alive on every connected session. A failed
//! heartbeat is logged and otherwise ignored; connection health is the
//! transport's status stream's business.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{ChannelSession, SessionMap};
use crate::transport::SendStatus;

/// Owns the background heartbeat task of one registry
pub struct HeartbeatScheduler {
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatScheduler {
    /// Spawn the heartbeat loop. The first beat fires one `period` from now.
    pub(crate) fn start(
        sessions: SessionMap,
        period: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let period = period.max(Duration::from_millis(1));
        let cancel_token = parent.child_token();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Heartbeat scheduler shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        let sent = Self::beat(&sessions).await;
                        debug!(sessions = sent, "Heartbeat round complete");
                    }
                }
            }
        });

        info!(interval_secs = period.as_secs_f64(), "Heartbeat scheduler started");

        Self {
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Send one heartbeat to every connected session.
    ///
    /// Returns the number of heartbeats the transport acknowledged.
    pub(crate) async fn beat(sessions: &SessionMap) -> usize {
        let connected: Vec<Arc<ChannelSession>> = sessions
            .read()
            .values()
            .filter(|session| session.is_connected())
            .cloned()
            .collect();

        let mut acknowledged = 0;
        for session in connected {
            match session.send_heartbeat().await {
                Ok(SendStatus::Ok) => acknowledged += 1,
                Ok(status) => warn!(
                    story_id = %session.story_id(),
                    status = ?status,
                    "Heartbeat not acknowledged"
                ),
                Err(e) => warn!(
                    story_id = %session.story_id(),
                    error = %e,
                    "Failed to send heartbeat"
                ),
            }
        }
        acknowledged
    }

    /// Stop the loop. Returns true only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        if self.cancel_token.is_cancelled() {
            return false;
        }
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("Heartbeat scheduler stopped");
        true
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
