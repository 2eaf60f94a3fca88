//! REST seam to the conversation server: the pull endpoint backing the
//! fallback poller, the selection guard, and every mutation. Mutations
//! never ride the socket; the HTTP acknowledgment is the authoritative
//! record and the push echo deduplicates against it.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tideline_proto::{
    ConversationRecord, ConversationScope, Message, MessageEdit, MessageId, ReactionChange,
    SendDraft,
};

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("conversation or message not found")]
    NotFound,
    #[error("access to the conversation was denied")]
    Forbidden,
    #[error("server rejected the request with status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("response could not be decoded: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Http(err.to_string())
        }
    }
}

/// Server capabilities the engine consumes. The trait exists so tests
/// can stand in a scripted server without a socket or an HTTP stack.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn conversation(
        &self,
        scope: &ConversationScope,
    ) -> Result<ConversationRecord, ApiError>;

    async fn recent_messages(
        &self,
        scope: &ConversationScope,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError>;

    async fn send_message(
        &self,
        scope: &ConversationScope,
        draft: SendDraft,
    ) -> Result<Message, ApiError>;

    async fn edit_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        edit: MessageEdit,
    ) -> Result<Message, ApiError>;

    async fn delete_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
    ) -> Result<(), ApiError>;

    async fn add_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError>;

    async fn remove_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError>;
}

/// Production implementation over the configured server base url, with
/// the out-of-band bearer token on every request.
pub struct HttpApi {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl HttpApi {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: config.server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn conversation_url(&self, scope: &ConversationScope) -> String {
        format!("{}/conversations/{}/{}", self.base, scope.kind(), scope.id())
    }

    fn messages_url(&self, scope: &ConversationScope) -> String {
        format!("{}/messages", self.conversation_url(scope))
    }

    fn message_url(&self, scope: &ConversationScope, id: &MessageId) -> String {
        format!("{}/{}", self.messages_url(scope), id.as_str())
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        Ok(check(response)?.json().await?)
    }
}

fn status_error(status: StatusCode) -> Option<ApiError> {
    match status {
        StatusCode::NOT_FOUND => Some(ApiError::NotFound),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Some(ApiError::Forbidden),
        status if status.is_success() => None,
        status => Some(ApiError::Status(status.as_u16())),
    }
}

fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    match status_error(response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn conversation(
        &self,
        scope: &ConversationScope,
    ) -> Result<ConversationRecord, ApiError> {
        let response = self
            .client
            .get(self.conversation_url(scope))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn recent_messages(
        &self,
        scope: &ConversationScope,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let response = self
            .client
            .get(self.messages_url(scope))
            .query(&[("limit", limit)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn send_message(
        &self,
        scope: &ConversationScope,
        draft: SendDraft,
    ) -> Result<Message, ApiError> {
        let response = self
            .client
            .post(self.messages_url(scope))
            .bearer_auth(&self.token)
            .json(&draft)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn edit_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        edit: MessageEdit,
    ) -> Result<Message, ApiError> {
        let response = self
            .client
            .patch(self.message_url(scope, id))
            .bearer_auth(&self.token)
            .json(&edit)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete_message(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
    ) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.message_url(scope, id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(response)?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        // Body-carried emoji; path segments and emoji encodings do not mix.
        let response = self
            .client
            .put(format!("{}/reactions", self.message_url(scope, id)))
            .bearer_auth(&self.token)
            .json(&ReactionChange {
                emoji: emoji.to_string(),
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn remove_reaction(
        &self,
        scope: &ConversationScope,
        id: &MessageId,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        let response = self
            .client
            .delete(format!("{}/reactions", self.message_url(scope, id)))
            .bearer_auth(&self.token)
            .json(&ReactionChange {
                emoji: emoji.to_string(),
            })
            .send()
            .await?;
        Self::decode(response).await
    }
}
