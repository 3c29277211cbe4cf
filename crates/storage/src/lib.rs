use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Conversation, Message, UserRef},
};

/// Local durable cache for conversations, messages and session secrets.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Shared-cache in-memory databases allow a single writer connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open local cache at '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply local cache migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or replaces messages by id and advances the owning conversation's
    /// last-message fields when a newer message arrives.
    pub async fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for message in messages {
            let attachments = serde_json::to_string(&message.attachments)?;
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sender_id, content, attachments, created_at_ms, updated_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    sender_id = excluded.sender_id,
                    content = excluded.content,
                    attachments = excluded.attachments,
                    updated_at_ms = excluded.updated_at_ms",
            )
            .bind(message.id.as_str())
            .bind(conversation_id.as_str())
            .bind(message.sender_id.as_str())
            .bind(message.content.as_deref())
            .bind(attachments)
            .bind(message.created_at.timestamp_millis())
            .bind(message.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert message {}", message.id))?;
        }

        if let Some(newest) = messages.iter().max_by_key(|m| m.created_at) {
            let newest_ms = newest.created_at.timestamp_millis();
            sqlx::query(
                "UPDATE conversations
                 SET last_message = ?,
                     last_message_at_ms = ?,
                     updated_at_ms = MAX(updated_at_ms, ?)
                 WHERE id = ? AND (last_message_at_ms IS NULL OR last_message_at_ms <= ?)",
            )
            .bind(newest.preview())
            .bind(newest_ms)
            .bind(newest_ms)
            .bind(conversation_id.as_str())
            .bind(newest_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "cache: messages upserted"
        );
        Ok(())
    }

    /// Messages of one conversation, oldest first; ties keep insertion order.
    pub async fn query_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, content, attachments, created_at_ms, updated_at_ms
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at_ms ASC, rowid ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn latest_message_time(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at_ms) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        latest.map(millis_to_datetime).transpose()
    }

    pub async fn delete_messages(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let participants = serde_json::to_string(&conversation.participants)?;
        sqlx::query(
            "INSERT INTO conversations (id, participants, created_at_ms, updated_at_ms, last_message, last_message_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                participants = excluded.participants,
                updated_at_ms = MAX(conversations.updated_at_ms, excluded.updated_at_ms),
                last_message = CASE
                    WHEN excluded.last_message_at_ms IS NOT NULL
                     AND (conversations.last_message_at_ms IS NULL
                          OR excluded.last_message_at_ms >= conversations.last_message_at_ms)
                    THEN excluded.last_message
                    ELSE conversations.last_message
                END,
                last_message_at_ms = MAX(
                    COALESCE(conversations.last_message_at_ms, excluded.last_message_at_ms),
                    COALESCE(excluded.last_message_at_ms, conversations.last_message_at_ms)
                )",
        )
        .bind(conversation.id.as_str())
        .bind(participants)
        .bind(conversation.created_at.timestamp_millis())
        .bind(conversation.updated_at.timestamp_millis())
        .bind(conversation.last_message.as_deref())
        .bind(conversation.last_message_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert conversation {}", conversation.id))?;
        Ok(())
    }

    pub async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, participants, created_at_ms, updated_at_ms, last_message, last_message_at_ms
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// All cached conversations, most recently updated first.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, participants, created_at_ms, updated_at_ms, last_message, last_message_at_ms
             FROM conversations
             ORDER BY updated_at_ms DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO secrets (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_secret(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM secrets WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_secret_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM secrets ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let attachments: String = row.try_get("attachments")?;
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        attachments: serde_json::from_str(&attachments)
            .context("corrupt attachments column in messages")?,
        created_at: millis_to_datetime(row.try_get("created_at_ms")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at_ms")?)?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let participants: String = row.try_get("participants")?;
    let participants: Vec<UserRef> = serde_json::from_str(&participants)
        .context("corrupt participants column in conversations")?;
    let last_message_at: Option<i64> = row.try_get("last_message_at_ms")?;
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        participants,
        created_at: millis_to_datetime(row.try_get("created_at_ms")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at_ms")?)?,
        last_message: row.try_get("last_message")?,
        last_message_at: last_message_at.map(millis_to_datetime).transpose()?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
