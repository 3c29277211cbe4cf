use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, CreateConversationRequest, Message, OutgoingMessage},
};

use crate::{
    error::ClientResult,
    request::{ApiRequest, RequestClient},
};

/// Formats a sync cursor the way the history endpoint expects it.
pub fn format_cursor(cursor: DateTime<Utc>) -> String {
    cursor.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Typed view of the chat endpoints. Every call is authenticated.
#[derive(Clone)]
pub struct ChatApi {
    client: Arc<RequestClient>,
}

impl ChatApi {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    /// Creates the conversation with `opponent_id`, or returns the existing one.
    pub async fn create_conversation(&self, opponent_id: &UserId) -> ClientResult<Conversation> {
        let request = ApiRequest::post("/chats").json(&CreateConversationRequest {
            opponent_id: opponent_id.clone(),
        })?;
        self.client.send_json(&request, true).await
    }

    pub async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        self.client.send_json(&ApiRequest::get("/chats"), true).await
    }

    /// Messages created at or after `after`; the whole history when `None`.
    pub async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        after: Option<DateTime<Utc>>,
    ) -> ClientResult<Vec<Message>> {
        let mut request = ApiRequest::get(format!("/chats/{conversation_id}"));
        if let Some(after) = after {
            request = request.query("next", format_cursor(after));
        }
        self.client.send_json(&request, true).await
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        message: &OutgoingMessage,
    ) -> ClientResult<Message> {
        let request = ApiRequest::post(format!("/chats/{conversation_id}")).json(message)?;
        self.client.send_json(&request, true).await
    }
}
