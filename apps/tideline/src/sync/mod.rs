//! Shared types of the sync layer: the connection-health flag the UI
//! watches and the active-scope cell every producer consults instead of
//! capturing it in a closure.

pub mod poller;
pub mod supervisor;

use parking_lot::RwLock;
use tideline_proto::ConversationScope;

/// Read-only connection indicator published by the reconnection
/// supervisor. `Degraded` carries the reconnect attempt being waited on;
/// `Offline` means the automatic budget is spent and only a manual
/// trigger restarts dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connecting,
    Online,
    Degraded { attempt: u32 },
    Offline,
}

impl ConnectionHealth {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionHealth::Online)
    }
}

/// The one writable copy of "which conversation is on screen". The
/// selector is the only writer; the poller, the push-event router, and
/// the store read it at call time, which is what keeps long-lived socket
/// callbacks from acting on a stale scope.
#[derive(Debug, Default)]
pub struct ActiveScope(RwLock<Option<ConversationScope>>);

impl ActiveScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ConversationScope> {
        self.0.read().clone()
    }

    pub fn is_active(&self, scope: &ConversationScope) -> bool {
        self.0.read().as_ref() == Some(scope)
    }

    pub(crate) fn set(&self, scope: Option<ConversationScope>) {
        *self.0.write() = scope;
    }
}
