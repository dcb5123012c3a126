use anyhow::{Context, Result};
use async_trait::async_trait;
use multiplexer::store::MessageStore;
use shared::{domain::MessageId, protocol::ContentMessage};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// SQLite-backed message history. Messages are kept in send order
/// (`sent_at_ms`, then insertion) and serialized whole as JSON.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        create_parent_dir(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn message_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn upsert_message(&self, message: &ContentMessage) -> Result<()> {
        let body = serde_json::to_string(message)
            .with_context(|| format!("failed to serialize message {}", message.id))?;
        sqlx::query(
            "INSERT INTO messages (message_id, sent_at_ms, body_json, updated_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(message_id) DO UPDATE SET sent_at_ms = excluded.sent_at_ms, body_json = excluded.body_json, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(message.id.as_str())
        .bind(message.timestamp.timestamp_millis())
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Messages after `last_known_id`; all of them when the id is absent or
    /// no longer stored.
    pub async fn messages_since(
        &self,
        last_known_id: Option<&MessageId>,
    ) -> Result<Vec<ContentMessage>> {
        let anchor = match last_known_id {
            Some(id) => sqlx::query("SELECT sent_at_ms, seq FROM messages WHERE message_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?
                .map(|r| (r.get::<i64, _>(0), r.get::<i64, _>(1))),
            None => None,
        };

        let rows = if let Some((sent_at_ms, seq)) = anchor {
            sqlx::query(
                "SELECT message_id, body_json FROM messages
                 WHERE sent_at_ms > ? OR (sent_at_ms = ? AND seq > ?)
                 ORDER BY sent_at_ms, seq",
            )
            .bind(sent_at_ms)
            .bind(sent_at_ms)
            .bind(seq)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("SELECT message_id, body_json FROM messages ORDER BY sent_at_ms, seq")
                .fetch_all(&self.pool)
                .await?
        };

        let messages = rows
            .into_iter()
            .map(|r| {
                let message_id = r.get::<String, _>(0);
                serde_json::from_str::<ContentMessage>(&r.get::<String, _>(1))
                    .with_context(|| format!("corrupt stored message {message_id}"))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            since = ?last_known_id.map(MessageId::as_str),
            loaded = messages.len(),
            "storage: loaded messages"
        );
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn load_since(&self, last_known_id: Option<&MessageId>) -> Result<Vec<ContentMessage>> {
        self.messages_since(last_known_id).await
    }

    async fn upsert(&self, message: &ContentMessage) -> Result<()> {
        self.upsert_message(message).await
    }

    async fn delete(&self, message_id: &MessageId) -> Result<()> {
        self.delete_message(message_id).await.map(|_| ())
    }
}

/// SQLite creates the database file on connect but not its parent directories.
fn create_parent_dir(database_url: &str) -> Result<()> {
    if let Some(parent) = sqlite_path(database_url).as_deref().and_then(Path::parent) {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "storage: cannot create {} for {database_url}",
                parent.display()
            )
        })?;
    }
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url.strip_prefix("sqlite:")?;
    if rest.starts_with(":memory:") {
        return None;
    }
    let path = rest
        .trim_start_matches("//")
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
