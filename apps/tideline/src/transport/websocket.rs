use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tideline_proto::{decode_server_event, encode_client_frame, ClientFrame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{ChannelEvent, CloseReason, ConnectionState, Dialer, SocketChannel, TransportError};
use crate::config::{Config, SyncTuning};

/// Production dialer: one websocket per dial, text frames carrying the
/// json wire contract. The bearer token rides in the first frame rather
/// than a header so the handshake works through permissive proxies.
pub struct WebSocketDialer {
    url: String,
    token: String,
    handshake_timeout: Duration,
}

impl WebSocketDialer {
    pub fn new(config: &Config, tuning: &SyncTuning) -> Result<Self, TransportError> {
        Ok(Self {
            url: socket_url(&config.server)?,
            token: config.token.clone(),
            handshake_timeout: tuning.handshake_timeout,
        })
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(
        &self,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<SocketChannel, TransportError> {
        let (ws_stream, _) =
            tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))?
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();

        // Queue the auth hello before anything else can be written.
        let hello = ClientFrame::Hello {
            token: self.token.clone(),
        };
        let _ = outbound_tx.send(hello);

        let state = Arc::new(RwLock::new(ConnectionState::Open));
        let _ = events.send(ChannelEvent::Opened).await;

        let task = tokio::spawn(run_socket(
            ws_stream,
            outbound_rx,
            events,
            state.clone(),
        ));

        Ok(SocketChannel::from_parts(state, outbound_tx, vec![task]))
    }
}

/// Pumps one socket until it dies: a writer sub-task drains outbound
/// frames while this task reads server frames and reports them.
async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::Sender<ChannelEvent>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match encode_client_frame(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => debug!(error = %err, "failed to encode outbound frame"),
            }
        }
    });

    let reason = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match decode_server_event(&text) {
                Ok(event) => {
                    if events.send(ChannelEvent::Event(event)).await.is_err() {
                        break CloseReason::Shutdown;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed server event");
                }
            },
            Some(Ok(Message::Close(_))) | None => break CloseReason::ServerClosed,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                break CloseReason::Io;
            }
        }
    };

    *state.write() = ConnectionState::Closed;
    let _ = events.send(ChannelEvent::Closed(reason)).await;
    send_task.abort();
}

/// Derives the socket endpoint from the configured server base. Plain
/// hosts default to wss:// except for local addresses.
fn socket_url(server: &str) -> Result<String, TransportError> {
    let base = if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server.contains("localhost") || server.contains("127.0.0.1") {
        format!("ws://{server}")
    } else {
        format!("wss://{server}")
    };
    let url = format!("{}/ws", base.trim_end_matches('/'));
    Url::parse(&url).map_err(|err| TransportError::BadUrl(err.to_string()))?;
    Ok(url)
}
