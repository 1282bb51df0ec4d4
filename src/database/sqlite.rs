// ABOUTME: SQLite implementation of the conversation store using sqlx
// ABOUTME: Owner-scoped queries, transactional message append, and cascade delete
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::DatabaseError;
use super::{
    ConversationStore, ConversationUpdate, ListQuery, NewConversation, NewMessage,
};
use crate::errors::{AppError, AppResult};
use crate::models::{
    Attachment, Conversation, ConversationSummary, ConversationTokenUsage, Message,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        total_tokens INTEGER NOT NULL DEFAULT 0,
        archived INTEGER NOT NULL DEFAULT 0,
        pinned INTEGER NOT NULL DEFAULT 0,
        message_count INTEGER NOT NULL DEFAULT 0,
        last_message_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_conversations_owner
        ON conversations (owner_id, pinned, updated_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations (id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        message_type TEXT NOT NULL DEFAULT 'text',
        attachments TEXT NOT NULL DEFAULT '[]',
        tokens INTEGER NOT NULL DEFAULT 0,
        complete INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE (conversation_id, seq)
    )
    ",
];

const CONVERSATION_COLUMNS: &str = "id, owner_id, title, tags, total_tokens, archived, pinned, \
     message_count, last_message_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, message_type, attachments, tokens, complete, created_at";

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_db_count(value: u64, field: &'static str) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| {
        DatabaseError::InvalidData {
            field,
            reason: format!("{value} does not fit in a signed 64-bit column"),
        }
        .into()
    })
}

fn from_db_count(value: i64, field: &'static str) -> AppResult<u64> {
    u64::try_from(value).map_err(|_| {
        DatabaseError::InvalidData {
            field,
            reason: format!("negative value {value}"),
        }
        .into()
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, field: &'static str) -> AppResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        DatabaseError::InvalidData {
            field,
            reason: e.to_string(),
        }
        .into()
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string(value).map_err(AppError::from)
}

/// sqlx-backed [`ConversationStore`]
#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    /// Connect to `database_url` and bootstrap the schema
    ///
    /// In-memory URLs get a single long-lived connection so every query sees
    /// the same database.
    ///
    /// # Errors
    ///
    /// Returns a database error if the URL is invalid, the connection fails,
    /// or the schema cannot be created.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionError {
                context: format!("invalid database URL: {e}"),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionError {
                context: e.to_string(),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        info!(in_memory, "Conversation store ready");
        Ok(store)
    }

    /// Wrap an existing pool; the schema must already exist or `migrate` be called
    #[must_use]
    pub const fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if absent
    ///
    /// # Errors
    ///
    /// Returns a database error if a statement fails.
    pub async fn migrate(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::MigrationError(e.to_string()))?;
        }
        Ok(())
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn message_ids(&self, conversation_id: &str) -> AppResult<Vec<String>> {
        sqlx::query_scalar("SELECT id FROM messages WHERE conversation_id = $1 ORDER BY seq")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to load message ids: {e}")))
    }

    fn conversation_from_row(row: &SqliteRow, message_ids: Vec<String>) -> AppResult<Conversation> {
        let tags: BTreeSet<String> = decode_json(row.get::<&str, _>("tags"), "tags")?;
        Ok(Conversation {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            title: row.get("title"),
            tags,
            message_ids,
            token_usage: ConversationTokenUsage::from_total(from_db_count(
                row.get("total_tokens"),
                "total_tokens",
            )?),
            archived: row.get("archived"),
            pinned: row.get("pinned"),
            last_message_at: row.get("last_message_at"),
            message_count: from_db_count(row.get("message_count"), "message_count")?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn summary_from_row(row: &SqliteRow) -> AppResult<ConversationSummary> {
        Ok(ConversationSummary {
            id: row.get("id"),
            title: row.get("title"),
            tags: decode_json(row.get::<&str, _>("tags"), "tags")?,
            pinned: row.get("pinned"),
            archived: row.get("archived"),
            message_count: from_db_count(row.get("message_count"), "message_count")?,
            token_usage: ConversationTokenUsage::from_total(from_db_count(
                row.get("total_tokens"),
                "total_tokens",
            )?),
            last_message_at: row.get("last_message_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn message_from_row(row: &SqliteRow) -> AppResult<Message> {
        let attachments: Vec<Attachment> =
            decode_json(row.get::<&str, _>("attachments"), "attachments")?;
        Ok(Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            role: row.get::<&str, _>("role").parse()?,
            content: row.get("content"),
            message_type: row.get::<&str, _>("message_type").parse()?,
            attachments,
            tokens: from_db_count(row.get("tokens"), "tokens")?,
            complete: row.get("complete"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        sqlx::query(
            r"
            INSERT INTO conversations (id, owner_id, title, tags, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ",
        )
        .bind(&id)
        .bind(&new.owner_id)
        .bind(&new.title)
        .bind(encode_json(&new.tags)?)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversation: {e}")))?;

        debug!(conversation_id = %id, "Created conversation");

        Ok(Conversation {
            id,
            owner_id: new.owner_id,
            title: new.title,
            tags: new.tags,
            message_ids: Vec::new(),
            token_usage: ConversationTokenUsage::default(),
            archived: false,
            pinned: false,
            last_message_at: None,
            message_count: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    async fn get_conversation(&self, id: &str, owner_id: &str) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get conversation: {e}")))?;

        match row {
            Some(row) => {
                let message_ids = self.message_ids(id).await?;
                Self::conversation_from_row(&row, message_ids).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_conversations(
        &self,
        owner_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<ConversationSummary>> {
        let query = query.clamped();
        let rows = sqlx::query(&format!(
            r"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE owner_id = $1 AND ($2 OR archived = 0)
            ORDER BY pinned DESC, updated_at DESC, id
            LIMIT $3 OFFSET $4
            "
        ))
        .bind(owner_id)
        .bind(query.include_archived)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list conversations: {e}")))?;

        rows.iter().map(Self::summary_from_row).collect()
    }

    async fn update_conversation(
        &self,
        id: &str,
        owner_id: &str,
        update: &ConversationUpdate,
    ) -> AppResult<Option<Conversation>> {
        let tags = update.tags.as_ref().map(encode_json).transpose()?;

        let result = sqlx::query(
            r"
            UPDATE conversations
            SET title = COALESCE($3, title),
                tags = COALESCE($4, tags),
                pinned = COALESCE($5, pinned),
                archived = COALESCE($6, archived),
                updated_at = $7
            WHERE id = $1 AND owner_id = $2
            ",
        )
        .bind(id)
        .bind(owner_id)
        .bind(update.title.as_deref())
        .bind(tags)
        .bind(update.pinned)
        .bind(update.archived)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to update conversation: {e}")))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_conversation(id, owner_id).await
    }

    async fn delete_conversation(&self, id: &str, owner_id: &str) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        let deleted = sqlx::query("DELETE FROM conversations WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("Failed to delete conversation: {e}")))?
            .rows_affected();

        if deleted > 0 {
            sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::database(format!("Failed to delete messages: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit delete: {e}")))?;

        Ok(deleted > 0)
    }

    async fn append_message(&self, new: NewMessage) -> AppResult<Message> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let tokens = to_db_count(new.tokens, "tokens")?;
        let attachments = encode_json(&new.attachments)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        let seq: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE conversations
            SET message_count = message_count + 1, last_message_at = $2, updated_at = $2
            WHERE id = $1
            RETURNING message_count
            ",
        )
        .bind(&new.conversation_id)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to reserve message slot: {e}")))?;

        let Some(seq) = seq else {
            return Err(AppError::not_found(format!(
                "Conversation {}",
                new.conversation_id
            )));
        };

        sqlx::query(
            r"
            INSERT INTO messages (id, conversation_id, seq, role, content, message_type,
                                  attachments, tokens, complete, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&id)
        .bind(&new.conversation_id)
        .bind(seq)
        .bind(new.role.as_str())
        .bind(&new.content)
        .bind(new.message_type.as_str())
        .bind(&attachments)
        .bind(tokens)
        .bind(new.complete)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert message: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit message: {e}")))?;

        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            role: new.role,
            content: new.content,
            message_type: new.message_type,
            attachments: new.attachments,
            tokens: new.tokens,
            complete: new.complete,
            created_at: now,
        })
    }

    async fn get_messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY seq"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get messages: {e}")))?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {MESSAGE_COLUMNS} FROM (
                SELECT *, seq AS position FROM messages
                WHERE conversation_id = $1
                ORDER BY seq DESC
                LIMIT $2
            )
            ORDER BY position
            "
        ))
        .bind(conversation_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get recent messages: {e}")))?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn add_token_usage(
        &self,
        conversation_id: &str,
        tokens: u64,
    ) -> AppResult<ConversationTokenUsage> {
        let total: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE conversations
            SET total_tokens = total_tokens + $2, updated_at = $3
            WHERE id = $1
            RETURNING total_tokens
            ",
        )
        .bind(conversation_id)
        .bind(to_db_count(tokens, "total_tokens")?)
        .bind(now_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to add token usage: {e}")))?;

        let total =
            total.ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;
        Ok(ConversationTokenUsage::from_total(from_db_count(
            total,
            "total_tokens",
        )?))
    }
}

impl std::fmt::Debug for SqliteConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConversationStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}
