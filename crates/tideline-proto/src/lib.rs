//! Shared wire contract between the tideline sync engine and the
//! conversation server. Keeping this in a dedicated crate allows a server
//! implementation or binding generator to consume the message shapes
//! without pulling in the engine runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DmId(pub String);

impl DmId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Addresses one conversation: a named channel or a direct-message pair.
/// Serialized externally tagged, e.g. `{"channel":"c-support"}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationScope {
    Channel(ChannelId),
    Dm(DmId),
}

impl ConversationScope {
    /// URL path segment for the scope family.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationScope::Channel(_) => "channel",
            ConversationScope::Dm(_) => "dm",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ConversationScope::Channel(id) => id.as_str(),
            ConversationScope::Dm(id) => id.as_str(),
        }
    }
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Human,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub url: String,
}

/// Emoji key to the set of users who applied it. Ordered maps keep
/// serialization and equality checks deterministic.
pub type ReactionMap = BTreeMap<String, BTreeSet<UserId>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub scope: ConversationScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub author_id: UserId,
    pub author_kind: AuthorKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: ReactionMap,
    #[serde(default)]
    pub reply_count: u32,
}

impl Message {
    /// Timestamp used when two copies of the same message compete: the
    /// last edit if there is one, otherwise creation time.
    pub fn freshness(&self) -> i64 {
        self.edited_at_ms.unwrap_or(self.created_at_ms)
    }

    /// Stable display order: creation time, message id as tie break.
    pub fn ordering_key(&self) -> (i64, &str) {
        (self.created_at_ms, self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_customer: Option<String>,
    #[serde(default)]
    pub agents: BTreeSet<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmRecord {
    pub id: DmId,
    pub participants: [UserId; 2],
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRecord {
    Channel(ChannelRecord),
    Dm(DmRecord),
}

impl ConversationRecord {
    pub fn scope(&self) -> ConversationScope {
        match self {
            ConversationRecord::Channel(c) => ConversationScope::Channel(c.id.clone()),
            ConversationRecord::Dm(d) => ConversationScope::Dm(d.id.clone()),
        }
    }
}

/// Push frames the server emits over the realtime socket. Unknown tags
/// decode to [`ServerEvent::Other`] so protocol additions never break an
/// older client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    MessageDeleted {
        scope: ConversationScope,
        message_id: MessageId,
    },
    ReactionChanged {
        scope: ConversationScope,
        message_id: MessageId,
        reactions: ReactionMap,
    },
    MembershipChanged {
        channel_id: ChannelId,
        members: BTreeSet<UserId>,
        #[serde(default)]
        agents: BTreeSet<AgentId>,
    },
    Typing {
        scope: ConversationScope,
        user_id: UserId,
        #[serde(default)]
        display_name: String,
        is_typing: bool,
    },
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Conversation the event touches, when it names one.
    pub fn scope(&self) -> Option<ConversationScope> {
        match self {
            ServerEvent::MessageCreated { message } | ServerEvent::MessageUpdated { message } => {
                Some(message.scope.clone())
            }
            ServerEvent::MessageDeleted { scope, .. }
            | ServerEvent::ReactionChanged { scope, .. }
            | ServerEvent::Typing { scope, .. } => Some(scope.clone()),
            ServerEvent::MembershipChanged { channel_id, .. } => {
                Some(ConversationScope::Channel(channel_id.clone()))
            }
            ServerEvent::Other => None,
        }
    }

    /// Rejects frames that parsed but cannot be applied: every event must
    /// carry non-empty ids for the rows it names.
    pub fn validate(&self) -> Result<(), ProtoError> {
        let ok = match self {
            ServerEvent::MessageCreated { message } | ServerEvent::MessageUpdated { message } => {
                !message.id.as_str().is_empty() && !message.scope.id().is_empty()
            }
            ServerEvent::MessageDeleted { scope, message_id }
            | ServerEvent::ReactionChanged {
                scope, message_id, ..
            } => !message_id.as_str().is_empty() && !scope.id().is_empty(),
            ServerEvent::MembershipChanged { channel_id, .. } => !channel_id.as_str().is_empty(),
            ServerEvent::Typing { scope, user_id, .. } => {
                !user_id.as_str().is_empty() && !scope.id().is_empty()
            }
            ServerEvent::Other => true,
        };
        if ok { Ok(()) } else { Err(ProtoError::MissingId) }
    }
}

/// Frames the client writes to the socket. Everything that mutates
/// conversation state goes over HTTP instead; the socket only carries the
/// auth hello and ephemeral typing signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        token: String,
    },
    Typing {
        scope: ConversationScope,
        is_typing: bool,
    },
}

/// Body of `POST …/messages`. `client_ref` lets the server deduplicate a
/// retried send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendDraft {
    pub client_ref: Uuid,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

impl SendDraft {
    pub fn new(body: impl Into<String>, parent_id: Option<MessageId>) -> Self {
        Self {
            client_ref: Uuid::new_v4(),
            body: body.into(),
            parent_id,
        }
    }
}

/// Body of `PATCH …/messages/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub body: String,
}

/// Body of `PUT`/`DELETE …/messages/{id}/reactions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionChange {
    pub emoji: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing a required id")]
    MissingId,
}

/// Decodes one socket text frame, rejecting frames without usable ids.
pub fn decode_server_event(raw: &str) -> Result<ServerEvent, ProtoError> {
    let event: ServerEvent = serde_json::from_str(raw)?;
    event.validate()?;
    Ok(event)
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(frame)?)
}

/// Milliseconds since the unix epoch, the timestamp unit used across the
/// wire contract.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
