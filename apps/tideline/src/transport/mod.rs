//! Realtime push channel to the conversation server. One
//! [`SocketChannel`] wraps exactly one socket: once it closes it never
//! reopens, and the reconnection supervisor dials a fresh one through the
//! [`Dialer`] seam. The mock dialer backs tests; the websocket dialer is
//! the production implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tideline_proto::{ClientFrame, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub mod mock;
pub mod websocket;

/// Lifecycle of a single socket instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Why a channel stopped. `Shutdown` is the only locally-initiated close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerClosed,
    Io,
    Shutdown,
}

/// What a live channel reports back to its owner.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Event(ServerEvent),
    Closed(CloseReason),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    BadUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Dials one socket and reports its events into `events`. Each call
/// produces an independent channel instance.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, events: mpsc::Sender<ChannelEvent>) -> Result<SocketChannel, TransportError>;
}

/// Cheap clonable handle for writing frames to a live channel. Frames are
/// dropped, not queued, when the socket is not open.
#[derive(Clone)]
pub struct FrameSink {
    state: Arc<RwLock<ConnectionState>>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl FrameSink {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Queues a frame for the writer task. Returns false when the frame
    /// was dropped because the channel is closed.
    pub fn send(&self, frame: ClientFrame) -> bool {
        if self.state() != ConnectionState::Open {
            debug!(state = ?self.state(), "dropping outbound frame; channel not open");
            return false;
        }
        if self.outbound.send(frame).is_err() {
            debug!("dropping outbound frame; writer task gone");
            return false;
        }
        true
    }
}

/// One live socket: a sink for outbound frames plus the reader/writer
/// tasks pumping it. Dropping the channel aborts the tasks.
pub struct SocketChannel {
    sink: FrameSink,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketChannel {
    pub(crate) fn from_parts(
        state: Arc<RwLock<ConnectionState>>,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            sink: FrameSink { state, outbound },
            tasks,
        }
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.sink.state()
    }

    pub fn send(&self, frame: ClientFrame) -> bool {
        self.sink.send(frame)
    }

    /// Marks the channel closed and stops its tasks. The instance is
    /// finished; reconnecting means dialing a new one.
    pub fn shutdown(mut self) {
        *self.sink.state.write() = ConnectionState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        *self.sink.state.write() = ConnectionState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
