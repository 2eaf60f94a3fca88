//! Client facade: wires the store, presence tracker, supervisor, and
//! poller together and exposes the surface the UI consumes — read
//! snapshots, the mutation entry points, and typing notification.

pub mod selector;

use std::sync::Arc;

use tideline_proto::{
    ConversationScope, Message, MessageEdit, MessageId, SendDraft, ServerEvent, now_ms,
};
use tokio::sync::watch;
use tracing::debug;

use crate::api::{ApiError, ConversationApi, HttpApi};
use crate::config::{Config, SyncTuning};
use crate::presence::{PresenceTracker, Typist, TypingEmitter};
use crate::store::{
    ConversationSnapshot, ConversationSummary, ObserverId, ReconciliationStore, StoreObserver,
};
use crate::sync::poller::Poller;
use crate::sync::supervisor::{PushHandler, Supervisor};
use crate::sync::{ActiveScope, ConnectionHealth};
use crate::transport::websocket::WebSocketDialer;
use crate::transport::{Dialer, TransportError};

use selector::Selector;

/// Everything the UI needs to render the active conversation.
#[derive(Debug, Clone)]
pub struct ActiveView {
    pub scope: ConversationScope,
    pub messages: Vec<Message>,
    pub typists: Vec<Typist>,
    pub unread: u32,
    pub thread: Option<MessageId>,
    pub health: ConnectionHealth,
}

/// Splits the push stream: typing signals feed the presence tracker,
/// everything else merges into the store.
struct EventRouter {
    store: Arc<ReconciliationStore>,
    presence: Arc<PresenceTracker>,
}

impl PushHandler for EventRouter {
    fn handle_event(&self, event: ServerEvent, active: &ActiveScope) {
        match event {
            ServerEvent::Typing {
                scope,
                user_id,
                display_name,
                is_typing,
            } => {
                if is_typing {
                    self.presence.signal_typing(scope, user_id, display_name);
                } else {
                    self.presence.signal_stopped(&scope, &user_id);
                }
            }
            ServerEvent::Other => debug!("ignoring unrecognized server event"),
            event => self.store.apply_push_event(&event, active),
        }
    }
}

/// One synchronizer instance. Construct with [`SyncClient::connect`] in
/// production or [`SyncClient::spawn`] with injected seams in tests; tear
/// down with [`SyncClient::shutdown`].
pub struct SyncClient {
    api: Arc<dyn ConversationApi>,
    store: Arc<ReconciliationStore>,
    presence: Arc<PresenceTracker>,
    emitter: TypingEmitter,
    selector: Selector,
    active: Arc<ActiveScope>,
    supervisor: Supervisor,
    poller: Poller,
    tuning: SyncTuning,
}

impl SyncClient {
    /// Production wiring: websocket dialer plus HTTP api, both derived
    /// from the config. Must be called from within a tokio runtime.
    pub fn connect(config: &Config, tuning: SyncTuning) -> Result<Self, TransportError> {
        let dialer = Arc::new(WebSocketDialer::new(config, &tuning)?);
        let api = Arc::new(HttpApi::new(config));
        Ok(Self::spawn(tuning, dialer, api))
    }

    /// Wires the engine with explicit transport and api seams.
    pub fn spawn(
        tuning: SyncTuning,
        dialer: Arc<dyn Dialer>,
        api: Arc<dyn ConversationApi>,
    ) -> Self {
        let active = Arc::new(ActiveScope::new());
        let store = Arc::new(ReconciliationStore::new());
        let presence = Arc::new(PresenceTracker::new(tuning.typing_window));
        let emitter = TypingEmitter::new(tuning.typing_debounce);
        let selector = Selector::new(active.clone());
        let router = Arc::new(EventRouter {
            store: store.clone(),
            presence: presence.clone(),
        });
        let supervisor = Supervisor::spawn(dialer, tuning.clone(), router, active.clone());
        let poller = Poller::spawn(
            api.clone(),
            store.clone(),
            presence.clone(),
            active.clone(),
            &tuning,
        );
        Self {
            api,
            store,
            presence,
            emitter,
            selector,
            active,
            supervisor,
            poller,
            tuning,
        }
    }

    /// Switches the active conversation. The server's rejection of the
    /// guard fetch (`NotFound`/`Forbidden`) aborts the switch; on success
    /// the scope is seeded with an immediate pull so the UI is not left
    /// waiting for the next poll tick.
    pub async fn select(&self, scope: ConversationScope) -> Result<(), ApiError> {
        let record = self.api.conversation(&scope).await?;
        self.store.upsert_conversation(record);

        if let Some(frame) = self.emitter.pause() {
            self.supervisor.send_frame(frame);
        }
        self.selector.activate(scope.clone());
        self.store.reset_unread(&scope);

        match self.api.recent_messages(&scope, self.tuning.poll_limit).await {
            Ok(messages) => self.store.apply_poll_snapshot(&scope, messages),
            Err(err) => debug!(%scope, error = %err, "seed fetch failed; poller will catch up"),
        }
        Ok(())
    }

    /// Sends a message; the store picks it up from the acknowledgment,
    /// never optimistically.
    pub async fn send_message(
        &self,
        scope: &ConversationScope,
        body: impl Into<String>,
        parent: Option<MessageId>,
    ) -> Result<Message, ApiError> {
        let draft = SendDraft::new(body, parent);
        let message = self.api.send_message(scope, draft).await?;
        self.store.insert_acked(message.clone());
        Ok(message)
    }

    /// Edits optimistically: the new body shows immediately, the server
    /// acknowledgment replaces it, and a rejection rolls the message back
    /// to its prior record.
    pub async fn edit_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        body: impl Into<String>,
    ) -> Result<Message, ApiError> {
        let body = body.into();
        let prior = self.store.message(scope, id);
        if let Some(prior) = &prior {
            let mut optimistic = prior.clone();
            optimistic.body = body.clone();
            optimistic.edited_at_ms = Some(now_ms());
            self.store.replace_message(optimistic);
        }
        match self.api.edit_message(scope, id, MessageEdit { body }).await {
            Ok(acked) => {
                // Last server acknowledgment wins over the optimistic copy.
                self.store.replace_message(acked.clone());
                Ok(acked)
            }
            Err(err) => {
                if let Some(prior) = prior {
                    self.store.replace_message(prior);
                }
                Err(err)
            }
        }
    }

    /// Deletes on acknowledgment only; a destructive operation is never
    /// applied optimistically.
    pub async fn delete_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
    ) -> Result<(), ApiError> {
        self.api.delete_message(scope, id).await?;
        self.store.remove_message(scope, id);
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        let acked = self.api.add_reaction(scope, id, emoji).await?;
        self.store.replace_message(acked.clone());
        Ok(acked)
    }

    pub async fn remove_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        let acked = self.api.remove_reaction(scope, id, emoji).await?;
        self.store.replace_message(acked.clone());
        Ok(acked)
    }

    /// Read model of the active conversation, or `None` before the first
    /// successful `select`.
    pub fn active_view(&self) -> Option<ActiveView> {
        let scope = self.active.get()?;
        let snapshot = self.store.snapshot(&scope);
        Some(ActiveView {
            messages: snapshot.messages,
            unread: snapshot.unread,
            typists: self.presence.typists(&scope),
            thread: self.selector.active_thread(),
            health: self.supervisor.current_health(),
            scope,
        })
    }

    /// Snapshot of any conversation, active or not.
    pub fn conversation_snapshot(&self, scope: &ConversationScope) -> ConversationSnapshot {
        self.store.snapshot(scope)
    }

    pub fn directory(&self) -> Vec<ConversationSummary> {
        self.store.directory()
    }

    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.supervisor.health()
    }

    pub fn observe(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        self.store.observe(observer)
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.store.unobserve(id);
    }

    /// Opens the thread sub-view on a message of the active conversation.
    pub fn open_thread(&self, root: MessageId) -> Result<(), ApiError> {
        let scope = self.active.get().ok_or(ApiError::NotFound)?;
        if self.store.message(&scope, &root).is_none() {
            return Err(ApiError::NotFound);
        }
        self.selector.open_thread(root);
        Ok(())
    }

    pub fn close_thread(&self) {
        self.selector.clear_thread();
    }

    /// Call on every local keystroke; the emitter decides whether a
    /// refresh frame actually goes out.
    pub fn notify_typing(&self) {
        let Some(scope) = self.active.get() else { return };
        if let Some(frame) = self.emitter.keystroke(&scope) {
            self.supervisor.send_frame(frame);
        }
    }

    /// Call when the local user pauses or clears the composer.
    pub fn notify_stopped(&self) {
        if let Some(frame) = self.emitter.pause() {
            self.supervisor.send_frame(frame);
        }
    }

    pub fn reconnect_now(&self) {
        self.supervisor.reconnect_now();
    }

    /// Tears down the poll loop and the supervisor; no callback fires
    /// after this returns.
    pub async fn shutdown(self) {
        self.poller.shutdown();
        self.supervisor.shutdown().await;
    }
}
