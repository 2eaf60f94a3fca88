//! Reconciliation Store: the single source of truth for in-memory
//! conversation state. Push events and poll snapshots land here from two
//! independent producers; the store merges them under one lock,
//! deduplicates by id, guards against stale copies overwriting fresher
//! ones, and keeps every conversation's list sorted so readers never see
//! a partially merged view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tideline_proto::{
    ConversationRecord, ConversationScope, Message, MessageId, ReactionMap, ServerEvent,
};
use tracing::{debug, warn};

use crate::sync::ActiveScope;

/// Cloned, ordered slice of one conversation. The store hands out copies;
/// nothing the UI does with a snapshot can corrupt the merge state.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub unread: u32,
    pub last_activity_ms: i64,
}

/// One row of the conversation directory.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub scope: ConversationScope,
    pub record: Option<ConversationRecord>,
    pub unread: u32,
    pub last_activity_ms: i64,
}

/// Notified synchronously after every merge that changed state, outside
/// the store lock. This is the reactivity seam: a UI layer registers one
/// observer and re-reads its snapshot on each call.
pub trait StoreObserver: Send + Sync {
    fn store_changed(&self, scope: &ConversationScope);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    unread: u32,
    last_activity_ms: i64,
}

impl ConversationLog {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn resort(&mut self) {
        self.messages
            .sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
    }

    fn touch(&mut self, ts: i64) {
        if ts > self.last_activity_ms {
            self.last_activity_ms = ts;
        }
    }

    fn adjust_reply_count(&mut self, parent: &MessageId, delta: i32) {
        if let Some(idx) = self.position(parent) {
            let count = &mut self.messages[idx].reply_count;
            *count = if delta < 0 {
                count.saturating_sub(delta.unsigned_abs())
            } else {
                count.saturating_add(delta as u32)
            };
        }
    }
}

#[derive(Default)]
struct StoreInner {
    logs: BTreeMap<ConversationScope, ConversationLog>,
    directory: BTreeMap<ConversationScope, ConversationRecord>,
}

impl StoreInner {
    fn log(&mut self, scope: &ConversationScope) -> &mut ConversationLog {
        self.logs.entry(scope.clone()).or_default()
    }

    /// Insert path shared by push creates and HTTP send acks. Returns the
    /// changed scope, or `None` when the id was already resident.
    fn insert_message(&mut self, message: &Message, count_unread: bool) -> Option<ConversationScope> {
        let scope = message.scope.clone();
        let log = self.log(&scope);
        if log.position(&message.id).is_some() {
            debug!(id = %message.id, %scope, "duplicate message create ignored");
            return None;
        }
        log.messages.push(message.clone());
        log.resort();
        log.touch(message.freshness());
        if count_unread {
            log.unread = log.unread.saturating_add(1);
        }
        if let Some(parent) = message.parent_id.clone() {
            log.adjust_reply_count(&parent, 1);
        }
        Some(scope)
    }

    /// Full-record replace by id. A copy older than the resident one is a
    /// reordered echo and is dropped; an absent target means a delete
    /// raced ahead of this echo, which is a legitimate no-op.
    fn update_message(&mut self, message: &Message) -> Option<ConversationScope> {
        let scope = message.scope.clone();
        let Some(log) = self.logs.get_mut(&scope) else {
            debug!(id = %message.id, %scope, "update for unknown conversation ignored");
            return None;
        };
        let Some(idx) = log.position(&message.id) else {
            debug!(id = %message.id, %scope, "update for absent message ignored");
            return None;
        };
        if message.freshness() < log.messages[idx].freshness() {
            debug!(id = %message.id, %scope, "stale update echo dropped");
            return None;
        }
        log.messages[idx] = message.clone();
        log.resort();
        log.touch(message.freshness());
        Some(scope)
    }

    fn delete_message(
        &mut self,
        scope: &ConversationScope,
        id: &MessageId,
    ) -> Option<ConversationScope> {
        let log = self.logs.get_mut(scope)?;
        let idx = log.position(id)?;
        let removed = log.messages.remove(idx);
        if let Some(parent) = removed.parent_id {
            log.adjust_reply_count(&parent, -1);
        }
        Some(scope.clone())
    }

    fn replace_reactions(
        &mut self,
        scope: &ConversationScope,
        id: &MessageId,
        reactions: &ReactionMap,
    ) -> Option<ConversationScope> {
        let log = self.logs.get_mut(scope)?;
        let idx = log.position(id)?;
        log.messages[idx].reactions = reactions.clone();
        Some(scope.clone())
    }
}

/// See the module docs. One instance per engine; every producer shares it
/// behind an `Arc`.
#[derive(Default)]
pub struct ReconciliationStore {
    inner: Mutex<StoreInner>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn StoreObserver>)>>,
    next_observer: AtomicU64,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one push event. Malformed events are dropped and logged,
    /// never surfaced; `active` decides whether a created message counts
    /// toward the unread counter of its conversation.
    pub fn apply_push_event(&self, event: &ServerEvent, active: &ActiveScope) {
        if let Err(err) = event.validate() {
            warn!(error = %err, "dropping malformed push event");
            return;
        }
        let changed = {
            let mut inner = self.inner.lock();
            match event {
                ServerEvent::MessageCreated { message } => {
                    let count_unread = !active.is_active(&message.scope);
                    inner.insert_message(message, count_unread)
                }
                ServerEvent::MessageUpdated { message } => inner.update_message(message),
                ServerEvent::MessageDeleted { scope, message_id } => {
                    inner.delete_message(scope, message_id)
                }
                ServerEvent::ReactionChanged {
                    scope,
                    message_id,
                    reactions,
                } => inner.replace_reactions(scope, message_id, reactions),
                ServerEvent::MembershipChanged {
                    channel_id,
                    members,
                    agents,
                } => {
                    let scope = ConversationScope::Channel(channel_id.clone());
                    match inner.directory.get_mut(&scope) {
                        Some(ConversationRecord::Channel(channel)) => {
                            channel.members = members.clone();
                            channel.agents = agents.clone();
                            Some(scope)
                        }
                        _ => {
                            debug!(%scope, "membership change for unknown channel ignored");
                            None
                        }
                    }
                }
                ServerEvent::Typing { .. } | ServerEvent::Other => None,
            }
        };
        if let Some(scope) = changed {
            self.notify(&scope);
        }
    }

    /// Set-union merge of an authoritative recent-message pull. The
    /// resident copy wins unless the incoming one is strictly fresher, so
    /// a poll response that raced a push-delivered edit cannot revert it.
    /// Rows tagged for another conversation are dropped; a bad pull never
    /// leaks across scopes.
    pub fn apply_poll_snapshot(&self, scope: &ConversationScope, messages: Vec<Message>) {
        let mut changed = false;
        {
            let mut inner = self.inner.lock();
            let log = inner.log(scope);
            for incoming in messages {
                if incoming.id.as_str().is_empty() {
                    warn!(%scope, "dropping poll row without an id");
                    continue;
                }
                if &incoming.scope != scope {
                    warn!(id = %incoming.id, %scope, row_scope = %incoming.scope,
                        "dropping poll row tagged for another conversation");
                    continue;
                }
                match log.position(&incoming.id) {
                    Some(idx) => {
                        if incoming.freshness() > log.messages[idx].freshness() {
                            log.touch(incoming.freshness());
                            log.messages[idx] = incoming;
                            changed = true;
                        }
                    }
                    None => {
                        log.touch(incoming.freshness());
                        log.messages.push(incoming);
                        changed = true;
                    }
                }
            }
            if changed {
                log.resort();
            }
        }
        if changed {
            self.notify(scope);
        }
    }

    /// Insert of an HTTP-acknowledged send. Deduplicates against the push
    /// echo of the same message; never counts toward unread.
    pub fn insert_acked(&self, message: Message) {
        let changed = self.inner.lock().insert_message(&message, false);
        if let Some(scope) = changed {
            self.notify(&scope);
        }
    }

    /// Unconditional upsert, bypassing the freshness guard. Used for
    /// optimistic edits, their rollback, and server acks, where the caller
    /// already knows which copy wins.
    pub fn replace_message(&self, message: Message) {
        let scope = message.scope.clone();
        {
            let mut inner = self.inner.lock();
            let log = inner.log(&scope);
            match log.position(&message.id) {
                Some(idx) => log.messages[idx] = message,
                None => log.messages.push(message),
            }
            log.resort();
        }
        self.notify(&scope);
    }

    /// Removal on a delete acknowledgment; same bookkeeping as a push
    /// delete.
    pub fn remove_message(&self, scope: &ConversationScope, id: &MessageId) {
        let changed = self.inner.lock().delete_message(scope, id);
        if let Some(scope) = changed {
            self.notify(&scope);
        }
    }

    pub fn message(&self, scope: &ConversationScope, id: &MessageId) -> Option<Message> {
        let inner = self.inner.lock();
        let log = inner.logs.get(scope)?;
        log.messages.iter().find(|m| &m.id == id).cloned()
    }

    pub fn reset_unread(&self, scope: &ConversationScope) {
        let changed = {
            let mut inner = self.inner.lock();
            let log = inner.log(scope);
            let had = log.unread != 0;
            log.unread = 0;
            had
        };
        if changed {
            self.notify(scope);
        }
    }

    pub fn upsert_conversation(&self, record: ConversationRecord) {
        let scope = record.scope();
        let changed = {
            let mut inner = self.inner.lock();
            inner.directory.insert(scope.clone(), record.clone()) != Some(record)
        };
        if changed {
            self.notify(&scope);
        }
    }

    pub fn snapshot(&self, scope: &ConversationScope) -> ConversationSnapshot {
        let inner = self.inner.lock();
        match inner.logs.get(scope) {
            Some(log) => ConversationSnapshot {
                messages: log.messages.clone(),
                unread: log.unread,
                last_activity_ms: log.last_activity_ms,
            },
            None => ConversationSnapshot::default(),
        }
    }

    /// Every conversation the store has heard of: known records plus any
    /// scope that only ever appeared on a message.
    pub fn directory(&self) -> Vec<ConversationSummary> {
        let inner = self.inner.lock();
        let mut scopes: Vec<ConversationScope> = inner.directory.keys().cloned().collect();
        for scope in inner.logs.keys() {
            if !inner.directory.contains_key(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
            .into_iter()
            .map(|scope| {
                let log = inner.logs.get(&scope);
                ConversationSummary {
                    record: inner.directory.get(&scope).cloned(),
                    unread: log.map(|l| l.unread).unwrap_or(0),
                    last_activity_ms: log.map(|l| l.last_activity_ms).unwrap_or(0),
                    scope,
                }
            })
            .collect()
    }

    pub fn observe(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }

    fn notify(&self, scope: &ConversationScope) {
        let observers: Vec<Arc<dyn StoreObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.store_changed(scope);
        }
    }
}
