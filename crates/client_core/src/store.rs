use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    protocol::{Conversation, Message},
};
use storage::Storage;
use tokio::sync::RwLock;

use crate::error::{ClientError, ClientResult};

/// Opaque secret persistence. Only the session manager touches it.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with [`ClientError::NotFound`] when no secret is stored under `key`.
    async fn get(&self, key: &str) -> ClientResult<String>;
    async fn set(&self, key: &str, secret: &str) -> ClientResult<()>;
    async fn delete(&self, key: &str) -> ClientResult<()>;
}

/// Local durable cache of conversations and messages. Only the sync engine
/// writes to it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> ClientResult<()>;
    /// Ordered by `created_at` ascending.
    async fn query_messages(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>>;
    async fn latest_message_time(
        &self,
        conversation_id: &ConversationId,
    ) -> ClientResult<Option<DateTime<Utc>>>;
    async fn delete_messages(&self, conversation_id: &ConversationId) -> ClientResult<()>;
    async fn upsert_conversation(&self, conversation: &Conversation) -> ClientResult<()>;
    /// Ordered by `updated_at` descending.
    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> ClientResult<String> {
        self.secrets
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("credential '{key}'")))
    }

    async fn set(&self, key: &str, secret: &str) -> ClientResult<()> {
        self.secrets
            .write()
            .await
            .insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClientResult<()> {
        self.secrets.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for Storage {
    async fn get(&self, key: &str) -> ClientResult<String> {
        self.get_secret(key)
            .await
            .map_err(ClientError::storage)?
            .ok_or_else(|| ClientError::NotFound(format!("credential '{key}'")))
    }

    async fn set(&self, key: &str, secret: &str) -> ClientResult<()> {
        self.set_secret(key, secret)
            .await
            .map_err(ClientError::storage)
    }

    async fn delete(&self, key: &str) -> ClientResult<()> {
        self.delete_secret(key).await.map_err(ClientError::storage)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> ClientResult<()> {
        Storage::upsert_messages(self, conversation_id, messages)
            .await
            .map_err(ClientError::storage)
    }

    async fn query_messages(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>> {
        Storage::query_messages(self, conversation_id)
            .await
            .map_err(ClientError::storage)
    }

    async fn latest_message_time(
        &self,
        conversation_id: &ConversationId,
    ) -> ClientResult<Option<DateTime<Utc>>> {
        Storage::latest_message_time(self, conversation_id)
            .await
            .map_err(ClientError::storage)
    }

    async fn delete_messages(&self, conversation_id: &ConversationId) -> ClientResult<()> {
        Storage::delete_messages(self, conversation_id)
            .await
            .map(|_| ())
            .map_err(ClientError::storage)
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> ClientResult<()> {
        Storage::upsert_conversation(self, conversation)
            .await
            .map_err(ClientError::storage)
    }

    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        Storage::list_conversations(self)
            .await
            .map_err(ClientError::storage)
    }
}
