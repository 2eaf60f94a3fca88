//! Reconnection Supervisor: owns the single live socket, redials it with
//! exponential backoff when it dies, and gives up after the attempt
//! budget is spent. Transport failures stop here; the only thing the
//! rest of the engine sees is the health flag and the decoded events.

use std::sync::Arc;

use parking_lot::Mutex;
use tideline_proto::{ClientFrame, ServerEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncTuning;
use crate::sync::{ActiveScope, ConnectionHealth};
use crate::transport::{ChannelEvent, Dialer, FrameSink, SocketChannel};

/// Receives every decoded push event. The active-scope lookup arrives as
/// an explicit argument on each call rather than living captured inside
/// the handler, so a handler constructed before the first `select` can
/// never act on a stale scope.
pub trait PushHandler: Send + Sync {
    fn handle_event(&self, event: ServerEvent, active: &ActiveScope);
}

enum Command {
    ReconnectNow,
    Shutdown,
}

pub struct Supervisor {
    control: mpsc::UnboundedSender<Command>,
    health: watch::Receiver<ConnectionHealth>,
    sink: Arc<Mutex<Option<FrameSink>>>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Starts the dial loop. Must be called from within a tokio runtime.
    pub fn spawn(
        dialer: Arc<dyn Dialer>,
        tuning: SyncTuning,
        handler: Arc<dyn PushHandler>,
        active: Arc<ActiveScope>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(ConnectionHealth::Connecting);
        let sink = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run(
            dialer,
            tuning,
            handler,
            active,
            control_rx,
            health_tx,
            sink.clone(),
        ));
        Self {
            control: control_tx,
            health: health_rx,
            sink,
            task,
        }
    }

    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.clone()
    }

    pub fn current_health(&self) -> ConnectionHealth {
        *self.health.borrow()
    }

    /// Writes a frame to the live channel; dropped (never buffered) when
    /// nothing is live.
    pub fn send_frame(&self, frame: ClientFrame) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(frame),
            None => {
                debug!("dropping outbound frame; no live channel");
                false
            }
        }
    }

    /// Manual trigger: restarts dialing with a fresh attempt budget,
    /// whether the loop is backing off, offline, or currently connected.
    pub fn reconnect_now(&self) {
        let _ = self.control.send(Command::ReconnectNow);
    }

    /// Tears the loop and any live channel down. No handler call or
    /// health update fires after this returns.
    pub async fn shutdown(self) {
        let _ = self.control.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

enum PumpOutcome {
    Lost { opened: bool },
    Reconnect,
    Shutdown,
}

async fn run(
    dialer: Arc<dyn Dialer>,
    tuning: SyncTuning,
    handler: Arc<dyn PushHandler>,
    active: Arc<ActiveScope>,
    mut control: mpsc::UnboundedReceiver<Command>,
    health: watch::Sender<ConnectionHealth>,
    sink: Arc<Mutex<Option<FrameSink>>>,
) {
    // Consecutive failed attempts since the last successful open.
    let mut attempts: u32 = 0;
    loop {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        match dialer.dial(events_tx).await {
            Ok(channel) => {
                *sink.lock() = Some(channel.sink());
                let outcome = pump(
                    channel,
                    &mut events_rx,
                    &mut control,
                    handler.as_ref(),
                    &active,
                    &health,
                )
                .await;
                *sink.lock() = None;
                match outcome {
                    PumpOutcome::Shutdown => return,
                    PumpOutcome::Reconnect => {
                        attempts = 0;
                        let _ = health.send(ConnectionHealth::Connecting);
                        continue;
                    }
                    PumpOutcome::Lost { opened } => {
                        if opened {
                            attempts = 0;
                        }
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, attempts, "dial failed");
            }
        }

        if attempts >= tuning.max_reconnect_attempts {
            warn!(attempts, "reconnect budget exhausted; staying offline until asked");
            let _ = health.send(ConnectionHealth::Offline);
            loop {
                match control.recv().await {
                    Some(Command::ReconnectNow) => {
                        attempts = 0;
                        let _ = health.send(ConnectionHealth::Connecting);
                        break;
                    }
                    Some(Command::Shutdown) | None => return,
                }
            }
            continue;
        }

        let delay = tuning.reconnect_delay(attempts);
        attempts += 1;
        info!(attempt = attempts, ?delay, "scheduling reconnect");
        let _ = health.send(ConnectionHealth::Degraded { attempt: attempts });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = control.recv() => match cmd {
                Some(Command::ReconnectNow) => {
                    attempts = 0;
                    let _ = health.send(ConnectionHealth::Connecting);
                }
                Some(Command::Shutdown) | None => return,
            }
        }
    }
}

/// Drives one live channel until it closes or the loop is told to stop.
async fn pump(
    channel: SocketChannel,
    events: &mut mpsc::Receiver<ChannelEvent>,
    control: &mut mpsc::UnboundedReceiver<Command>,
    handler: &dyn PushHandler,
    active: &ActiveScope,
    health: &watch::Sender<ConnectionHealth>,
) -> PumpOutcome {
    let mut channel = Some(channel);
    let mut opened = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Opened) => {
                    opened = true;
                    info!("realtime channel open");
                    let _ = health.send(ConnectionHealth::Online);
                }
                Some(ChannelEvent::Event(event)) => handler.handle_event(event, active),
                Some(ChannelEvent::Closed(reason)) => {
                    debug!(?reason, "realtime channel closed");
                    drop(channel.take());
                    return PumpOutcome::Lost { opened };
                }
                None => {
                    drop(channel.take());
                    return PumpOutcome::Lost { opened };
                }
            },
            cmd = control.recv() => {
                if let Some(channel) = channel.take() {
                    channel.shutdown();
                }
                return match cmd {
                    Some(Command::ReconnectNow) => PumpOutcome::Reconnect,
                    Some(Command::Shutdown) | None => PumpOutcome::Shutdown,
                };
            }
        }
    }
}
