//! Conversation Selector: the single writer of the active scope and the
//! thread sub-view pinned to it.

use std::sync::Arc;

use parking_lot::Mutex;
use tideline_proto::{ConversationScope, MessageId};

use crate::sync::ActiveScope;

pub struct Selector {
    active: Arc<ActiveScope>,
    thread: Mutex<Option<MessageId>>,
}

impl Selector {
    pub fn new(active: Arc<ActiveScope>) -> Self {
        Self {
            active,
            thread: Mutex::new(None),
        }
    }

    pub fn active_scope(&self) -> Option<ConversationScope> {
        self.active.get()
    }

    /// Makes `scope` the active conversation. The thread view belongs to
    /// the previous conversation and never survives the switch.
    pub(crate) fn activate(&self, scope: ConversationScope) {
        *self.thread.lock() = None;
        self.active.set(Some(scope));
    }

    pub fn open_thread(&self, root: MessageId) {
        *self.thread.lock() = Some(root);
    }

    pub fn active_thread(&self) -> Option<MessageId> {
        self.thread.lock().clone()
    }

    pub fn clear_thread(&self) {
        *self.thread.lock() = None;
    }
}
