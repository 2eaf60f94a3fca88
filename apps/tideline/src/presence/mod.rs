//! Typing presence: the tracker derives "who is typing" from transient
//! signals and forgets anyone who stops refreshing, so a sender that
//! disconnects mid-type cannot leave a ghost typist behind. The emitter
//! is the sender side of the same contract: at most one refresh frame
//! per debounce window, one explicit stop after a pause.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tideline_proto::{ClientFrame, ConversationScope, UserId};

/// One visible typist in the read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    pub user_id: UserId,
    pub display_name: String,
}

struct Entry {
    display_name: String,
    last_seen: Instant,
}

/// Per-(conversation, user) typing state. Expiry is evaluated on read,
/// so no timer is needed for correctness; `sweep` exists to keep the map
/// from accumulating entries for conversations nobody reads.
pub struct PresenceTracker {
    window: Duration,
    entries: Mutex<HashMap<(ConversationScope, UserId), Entry>>,
}

impl PresenceTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn signal_typing(&self, scope: ConversationScope, user_id: UserId, display_name: String) {
        self.signal_typing_at(scope, user_id, display_name, Instant::now());
    }

    pub fn signal_typing_at(
        &self,
        scope: ConversationScope,
        user_id: UserId,
        display_name: String,
        now: Instant,
    ) {
        self.entries.lock().insert(
            (scope, user_id),
            Entry {
                display_name,
                last_seen: now,
            },
        );
    }

    pub fn signal_stopped(&self, scope: &ConversationScope, user_id: &UserId) {
        self.entries
            .lock()
            .remove(&(scope.clone(), user_id.clone()));
    }

    pub fn typists(&self, scope: &ConversationScope) -> Vec<Typist> {
        self.typists_at(scope, Instant::now())
    }

    pub fn typists_at(&self, scope: &ConversationScope, now: Instant) -> Vec<Typist> {
        let entries = self.entries.lock();
        let mut typists: Vec<Typist> = entries
            .iter()
            .filter(|((entry_scope, _), entry)| {
                entry_scope == scope && now.saturating_duration_since(entry.last_seen) < self.window
            })
            .map(|((_, user_id), entry)| Typist {
                user_id: user_id.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect();
        typists.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        typists
    }

    /// Drops every expired entry. Called from the engine's poll tick.
    pub fn sweep(&self, now: Instant) {
        let window = self.window;
        self.entries
            .lock()
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < window);
    }
}

/// Debounces the local user's outbound typing signals. Returns the frame
/// to put on the socket, or `None` when the previous refresh still
/// covers this keystroke.
pub struct TypingEmitter {
    debounce: Duration,
    last: Mutex<Option<(ConversationScope, Instant)>>,
}

impl TypingEmitter {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last: Mutex::new(None),
        }
    }

    pub fn keystroke(&self, scope: &ConversationScope) -> Option<ClientFrame> {
        self.keystroke_at(scope, Instant::now())
    }

    pub fn keystroke_at(&self, scope: &ConversationScope, now: Instant) -> Option<ClientFrame> {
        let mut last = self.last.lock();
        let refresh = match &*last {
            Some((active, at)) if active == scope => {
                now.saturating_duration_since(*at) >= self.debounce
            }
            // First keystroke, or typing moved to another conversation.
            _ => true,
        };
        if !refresh {
            return None;
        }
        *last = Some((scope.clone(), now));
        Some(ClientFrame::Typing {
            scope: scope.clone(),
            is_typing: true,
        })
    }

    /// Explicit stop after a pause or a conversation switch. Emits once;
    /// a second pause with nothing in flight stays silent.
    pub fn pause(&self) -> Option<ClientFrame> {
        self.last.lock().take().map(|(scope, _)| ClientFrame::Typing {
            scope,
            is_typing: false,
        })
    }
}
