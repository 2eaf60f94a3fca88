//! Fallback Poller: a fixed-cadence pull of the active conversation's
//! recent messages. It runs whether or not the socket is healthy,
//! because push delivery can silently miss a message without the client
//! ever seeing a channel error; the next tick repairs it.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::api::ConversationApi;
use crate::config::SyncTuning;
use crate::presence::PresenceTracker;
use crate::store::ReconciliationStore;
use crate::sync::ActiveScope;

pub struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    /// Starts the poll loop. Must be called from within a tokio runtime.
    pub fn spawn(
        api: Arc<dyn ConversationApi>,
        store: Arc<ReconciliationStore>,
        presence: Arc<PresenceTracker>,
        active: Arc<ActiveScope>,
        tuning: &SyncTuning,
    ) -> Self {
        let interval = tuning.poll_interval;
        let request_timeout = tuning.poll_request_timeout;
        let limit = tuning.poll_limit;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Housekeeping rides the same cadence.
                presence.sweep(Instant::now());

                // Scope is captured here; a response landing after a
                // switch still merges into the conversation it was
                // fetched for, never the newly active one.
                let Some(scope) = active.get() else { continue };
                match tokio::time::timeout(request_timeout, api.recent_messages(&scope, limit))
                    .await
                {
                    Ok(Ok(messages)) => store.apply_poll_snapshot(&scope, messages),
                    Ok(Err(err)) => {
                        debug!(%scope, error = %err, "poll failed; retrying next tick");
                    }
                    Err(_) => debug!(%scope, "poll timed out; skipping cycle"),
                }
            }
        });
        Self { task }
    }

    /// Stops the loop; no tick fires after this returns.
    pub fn shutdown(self) {
        self.task.abort();
    }
}
