//! In-process conversation server for the integration suites: axum
//! serving the websocket push endpoint plus the REST pull and mutation
//! surface, so the real dialer and the real HTTP api get exercised
//! without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use tideline_core::config::Config;
use tideline_core::proto::{
    AuthorKind, ChannelId, ChannelRecord, ClientFrame, ConversationRecord, ConversationScope,
    DmId, DmRecord, Message, MessageEdit, MessageId, ReactionChange, SendDraft, ServerEvent,
    UserId, now_ms,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::new());
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/conversations/:kind/:id", get(get_conversation))
            .route(
                "/conversations/:kind/:id/messages",
                get(list_messages).post(post_message),
            )
            .route(
                "/conversations/:kind/:id/messages/:mid",
                axum::routing::patch(edit_message).delete(delete_message),
            )
            .route(
                "/conversations/:kind/:id/messages/:mid/reactions",
                axum::routing::put(add_reaction).delete(remove_reaction),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn config(&self) -> Config {
        Config {
            server: format!("http://{}", self.addr),
            token: "u-self".to_string(),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ServerState {
    messages: Mutex<HashMap<ConversationScope, Vec<Message>>>,
    conversations: Mutex<HashMap<ConversationScope, ConversationRecord>>,
    forbidden: Mutex<Vec<ConversationScope>>,
    pub push: broadcast::Sender<ServerEvent>,
    client_frames: Mutex<Vec<ClientFrame>>,
    next_id: AtomicU64,
}

impl ServerState {
    fn new() -> Self {
        let (push, _) = broadcast::channel(256);
        Self {
            messages: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            forbidden: Mutex::new(Vec::new()),
            push,
            client_frames: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn seed_channel(&self, id: &str, name: &str) -> ConversationScope {
        let scope = ConversationScope::Channel(ChannelId(id.to_string()));
        self.conversations.lock().insert(
            scope.clone(),
            ConversationRecord::Channel(ChannelRecord {
                id: ChannelId(id.to_string()),
                name: name.to_string(),
                private: false,
                description: String::new(),
                members: Default::default(),
                linked_customer: None,
                agents: Default::default(),
            }),
        );
        scope
    }

    pub fn seed_dm(&self, id: &str, a: &str, b: &str) -> ConversationScope {
        let scope = ConversationScope::Dm(DmId(id.to_string()));
        self.conversations.lock().insert(
            scope.clone(),
            ConversationRecord::Dm(DmRecord {
                id: DmId(id.to_string()),
                participants: [UserId(a.to_string()), UserId(b.to_string())],
                online: true,
            }),
        );
        scope
    }

    pub fn forbid(&self, scope: ConversationScope) {
        self.forbidden.lock().push(scope);
    }

    fn next_message_id(&self) -> MessageId {
        // Zero-padded so lexicographic id order matches creation order.
        MessageId(format!("m-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    /// Stores a message without broadcasting it: the "push silently
    /// missed this" scenario the poller exists for.
    pub fn insert_silently(&self, scope: &ConversationScope, author: &str, body: &str) -> Message {
        let message = Message {
            id: self.next_message_id(),
            scope: scope.clone(),
            parent_id: None,
            author_id: UserId(author.to_string()),
            author_kind: AuthorKind::Human,
            body: body.to_string(),
            attachments: Vec::new(),
            created_at_ms: now_ms(),
            edited_at_ms: None,
            reactions: Default::default(),
            reply_count: 0,
        };
        self.messages
            .lock()
            .entry(scope.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// Stores a message and broadcasts its creation over the socket.
    pub fn insert_and_push(&self, scope: &ConversationScope, author: &str, body: &str) -> Message {
        let message = self.insert_silently(scope, author, body);
        let _ = self.push.send(ServerEvent::MessageCreated {
            message: message.clone(),
        });
        message
    }

    pub fn push_typing(&self, scope: &ConversationScope, user: &str, name: &str, typing: bool) {
        let _ = self.push.send(ServerEvent::Typing {
            scope: scope.clone(),
            user_id: UserId(user.to_string()),
            display_name: name.to_string(),
            is_typing: typing,
        });
    }

    pub fn message_count(&self, scope: &ConversationScope) -> usize {
        self.messages
            .lock()
            .get(scope)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Frames the client wrote over the socket (hello included).
    pub fn received_frames(&self) -> Vec<ClientFrame> {
        self.client_frames.lock().clone()
    }

    pub fn typing_frames(&self) -> Vec<ClientFrame> {
        self.client_frames
            .lock()
            .iter()
            .filter(|f| matches!(f, ClientFrame::Typing { .. }))
            .cloned()
            .collect()
    }
}

fn scope_from(kind: &str, id: &str) -> Option<ConversationScope> {
    match kind {
        "channel" => Some(ConversationScope::Channel(ChannelId(id.to_string()))),
        "dm" => Some(ConversationScope::Dm(DmId(id.to_string()))),
        _ => None,
    }
}

fn bearer_user(headers: &HeaderMap) -> UserId {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("u-anonymous");
    UserId(token.to_string())
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let mut push = state.push.subscribe();
    loop {
        tokio::select! {
            event = push.recv() => match event {
                Ok(event) => {
                    let json = serde_json::to_string(&event).expect("encode push event");
                    if socket.send(WsMessage::Text(json)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        state.client_frames.lock().push(frame);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            }
        }
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let Some(scope) = scope_from(&kind, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if state.forbidden.lock().contains(&scope) {
        return StatusCode::FORBIDDEN.into_response();
    }
    match state.conversations.lock().get(&scope) {
        Some(record) => Json(record.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let Some(scope) = scope_from(&kind, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let all = state
        .messages
        .lock()
        .get(&scope)
        .cloned()
        .unwrap_or_default();
    let limit = query.limit.unwrap_or(50);
    let start = all.len().saturating_sub(limit);
    Json(all[start..].to_vec()).into_response()
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(draft): Json<SendDraft>,
) -> Response {
    let Some(scope) = scope_from(&kind, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let message = Message {
        id: state.next_message_id(),
        scope: scope.clone(),
        parent_id: draft.parent_id,
        author_id: bearer_user(&headers),
        author_kind: AuthorKind::Human,
        body: draft.body,
        attachments: Vec::new(),
        created_at_ms: now_ms(),
        edited_at_ms: None,
        reactions: Default::default(),
        reply_count: 0,
    };
    state
        .messages
        .lock()
        .entry(scope)
        .or_default()
        .push(message.clone());
    let _ = state.push.send(ServerEvent::MessageCreated {
        message: message.clone(),
    });
    Json(message).into_response()
}

async fn edit_message(
    State(state): State<Arc<ServerState>>,
    Path((kind, id, mid)): Path<(String, String, String)>,
    Json(edit): Json<MessageEdit>,
) -> Response {
    let Some(scope) = scope_from(&kind, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mid = MessageId(mid);
    let mut messages = state.messages.lock();
    let Some(message) = messages
        .get_mut(&scope)
        .and_then(|m| m.iter_mut().find(|m| m.id == mid))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    message.body = edit.body;
    message.edited_at_ms = Some(now_ms());
    let message = message.clone();
    drop(messages);
    let _ = state.push.send(ServerEvent::MessageUpdated {
        message: message.clone(),
    });
    Json(message).into_response()
}

async fn delete_message(
    State(state): State<Arc<ServerState>>,
    Path((kind, id, mid)): Path<(String, String, String)>,
) -> Response {
    let Some(scope) = scope_from(&kind, &id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mid = MessageId(mid);
    let mut messages = state.messages.lock();
    let Some(list) = messages.get_mut(&scope) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(idx) = list.iter().position(|m| m.id == mid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    list.remove(idx);
    drop(messages);
    let _ = state.push.send(ServerEvent::MessageDeleted {
        scope,
        message_id: mid,
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn add_reaction(
    State(state): State<Arc<ServerState>>,
    Path((kind, id, mid)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(change): Json<ReactionChange>,
) -> Response {
    mutate_reaction(state, &kind, &id, mid, headers, change, true)
}

async fn remove_reaction(
    State(state): State<Arc<ServerState>>,
    Path((kind, id, mid)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(change): Json<ReactionChange>,
) -> Response {
    mutate_reaction(state, &kind, &id, mid, headers, change, false)
}

fn mutate_reaction(
    state: Arc<ServerState>,
    kind: &str,
    id: &str,
    mid: String,
    headers: HeaderMap,
    change: ReactionChange,
    add: bool,
) -> Response {
    let Some(scope) = scope_from(kind, id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mid = MessageId(mid);
    let user = bearer_user(&headers);
    let mut messages = state.messages.lock();
    let Some(message) = messages
        .get_mut(&scope)
        .and_then(|m| m.iter_mut().find(|m| m.id == mid))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if add {
        message.reactions.entry(change.emoji).or_default().insert(user);
    } else if let Some(users) = message.reactions.get_mut(&change.emoji) {
        users.remove(&user);
        if users.is_empty() {
            message.reactions.remove(&change.emoji);
        }
    }
    let message = message.clone();
    drop(messages);
    let _ = state.push.send(ServerEvent::ReactionChanged {
        scope,
        message_id: mid,
        reactions: message.reactions.clone(),
    });
    Json(message).into_response()
}
