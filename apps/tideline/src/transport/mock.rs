//! Scripted in-memory dialer. Tests queue one [`DialPlan`] per expected
//! dial; the supervisor exercises its real reconnect logic against
//! refused dials, mid-stream drops, and duplicated events without a
//! network in sight. Exhausting the script refuses further dials, which
//! keeps backoff tests deterministic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tideline_proto::{ClientFrame, ServerEvent};
use tokio::sync::mpsc;

use super::{ChannelEvent, CloseReason, ConnectionState, Dialer, SocketChannel, TransportError};

/// What the next dial does.
pub enum DialPlan {
    /// Fail the dial outright, as a refused connection would.
    Refuse,
    /// Open, replay `events`, then optionally close.
    Open {
        events: Vec<ServerEvent>,
        then_close: Option<CloseReason>,
    },
}

impl DialPlan {
    /// Open and stay open with nothing scripted.
    pub fn open() -> Self {
        DialPlan::Open {
            events: Vec::new(),
            then_close: None,
        }
    }

    /// Open, deliver `events`, stay open.
    pub fn open_with(events: Vec<ServerEvent>) -> Self {
        DialPlan::Open {
            events,
            then_close: None,
        }
    }

    /// Open, deliver `events`, then drop the connection.
    pub fn drop_after(events: Vec<ServerEvent>) -> Self {
        DialPlan::Open {
            events,
            then_close: Some(CloseReason::Io),
        }
    }
}

struct LiveHandle {
    events: mpsc::Sender<ChannelEvent>,
    state: Arc<RwLock<ConnectionState>>,
}

#[derive(Default)]
pub struct MockDialer {
    plans: Mutex<VecDeque<DialPlan>>,
    dials: AtomicUsize,
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    live: Mutex<Option<LiveHandle>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(&self, plan: DialPlan) {
        self.plans.lock().push_back(plan);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Frames the engine wrote to the most recent live channel.
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().clone()
    }

    /// Pushes an event into the currently live channel. Returns false if
    /// no channel is live.
    pub async fn inject(&self, event: ServerEvent) -> bool {
        let sender = match self.live.lock().as_ref() {
            Some(handle) => handle.events.clone(),
            None => return false,
        };
        sender.send(ChannelEvent::Event(event)).await.is_ok()
    }

    /// Kills the currently live channel, as a dropped connection would.
    pub async fn close_live(&self, reason: CloseReason) -> bool {
        let handle = match self.live.lock().take() {
            Some(handle) => handle,
            None => return false,
        };
        *handle.state.write() = ConnectionState::Closed;
        handle.events.send(ChannelEvent::Closed(reason)).await.is_ok()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<SocketChannel, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .pop_front()
            .unwrap_or(DialPlan::Refuse);

        let (scripted, then_close) = match plan {
            DialPlan::Refuse => {
                return Err(TransportError::Connect("scripted refusal".to_string()));
            }
            DialPlan::Open { events, then_close } => (events, then_close),
        };

        let state = Arc::new(RwLock::new(ConnectionState::Open));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let sent = self.sent.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                sent.lock().push(frame);
            }
        });

        *self.live.lock() = Some(LiveHandle {
            events: events.clone(),
            state: state.clone(),
        });

        let feed_state = state.clone();
        let feeder = tokio::spawn(async move {
            let _ = events.send(ChannelEvent::Opened).await;
            for event in scripted {
                let _ = events.send(ChannelEvent::Event(event)).await;
            }
            if let Some(reason) = then_close {
                *feed_state.write() = ConnectionState::Closed;
                let _ = events.send(ChannelEvent::Closed(reason)).await;
            }
        });

        Ok(SocketChannel::from_parts(
            state,
            outbound_tx,
            vec![writer, feeder],
        ))
    }
}
