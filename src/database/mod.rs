// ABOUTME: Conversation store boundary used by the orchestrator and HTTP routes
// ABOUTME: Declares the async store trait plus the insert and update payloads it accepts
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Conversation Store
//!
//! Create/read/update/delete over conversations and their append-only
//! messages, keyed by identifier and read-after-write consistent in-process.
//! Every conversation read is scoped by owner: a conversation that exists but
//! belongs to someone else is indistinguishable from a missing one.
//!
//! [`SqliteConversationStore`] is the bundled implementation.

/// Store error types re-exported from parley-core
pub mod errors;
mod sqlite;

pub use sqlite::SqliteConversationStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

use crate::constants::limits;
use crate::errors::{AppError, AppResult};
use crate::models::{
    normalize_tags, Attachment, Conversation, ConversationSummary, ConversationTokenUsage,
    Message, MessageRole, MessageType,
};

/// Fields needed to open a conversation
#[derive(Debug, Clone)]
pub struct NewConversation {
    /// Caller that will own the conversation
    pub owner_id: String,
    /// Initial title
    pub title: String,
    /// Normalized tags
    pub tags: BTreeSet<String>,
}

/// Fields needed to append a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Target conversation
    pub conversation_id: String,
    /// Sender role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Content type
    pub message_type: MessageType,
    /// Attachment references
    pub attachments: Vec<Attachment>,
    /// Token count charged for the message
    pub tokens: u64,
    /// Whether the content is the full output
    pub complete: bool,
}

impl NewMessage {
    /// Plain text message with no attachments
    #[must_use]
    pub fn text(
        conversation_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        tokens: u64,
        complete: bool,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            message_type: MessageType::Text,
            attachments: Vec::new(),
            tokens,
            complete,
        }
    }
}

/// Paging and filtering for conversation listings
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    /// Page size, clamped to `1..=MAX_LIST_LIMIT`
    pub limit: i64,
    /// Rows to skip
    pub offset: i64,
    /// Include archived conversations
    pub include_archived: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: limits::DEFAULT_LIST_LIMIT,
            offset: 0,
            include_archived: false,
        }
    }
}

impl ListQuery {
    /// Limit and offset forced into their accepted ranges
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, limits::MAX_LIST_LIMIT),
            offset: self.offset.max(0),
            include_archived: self.include_archived,
        }
    }
}

/// Caller-editable conversation fields as received over the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPatch {
    /// New title
    pub title: Option<String>,
    /// Replacement tag list
    pub tags: Option<Vec<String>>,
    /// Pin or unpin
    pub pinned: Option<bool>,
    /// Archive or restore
    pub archived: Option<bool>,
}

/// Validated conversation update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationUpdate {
    /// New title
    pub title: Option<String>,
    /// Replacement tag set
    pub tags: Option<BTreeSet<String>>,
    /// Pin or unpin
    pub pinned: Option<bool>,
    /// Archive or restore
    pub archived: Option<bool>,
}

impl ConversationUpdate {
    /// Validate and normalize a patch
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a blank or overlong title, or a tag list that
    /// breaks the tag limits.
    pub fn from_patch(patch: ConversationPatch) -> AppResult<Self> {
        let title = match patch.title {
            Some(title) => {
                let title = title.trim().to_owned();
                if title.is_empty() {
                    return Err(AppError::invalid_input("Title must not be empty"));
                }
                if title.chars().count() > limits::MAX_TITLE_CHARS {
                    return Err(AppError::invalid_input(format!(
                        "Title exceeds {} characters",
                        limits::MAX_TITLE_CHARS
                    )));
                }
                Some(title)
            }
            None => None,
        };
        let tags = patch.tags.map(normalize_tags).transpose()?;

        Ok(Self {
            title,
            tags,
            pinned: patch.pinned,
            archived: patch.archived,
        })
    }

    /// True when nothing would change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.tags.is_none()
            && self.pinned.is_none()
            && self.archived.is_none()
    }
}

/// Persistence operations over conversations and messages
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a new, empty conversation
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation>;

    /// Fetch a conversation owned by `owner_id`
    async fn get_conversation(&self, id: &str, owner_id: &str) -> AppResult<Option<Conversation>>;

    /// List the owner's conversations, pinned first then most recently updated
    async fn list_conversations(
        &self,
        owner_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<ConversationSummary>>;

    /// Apply an update; `None` when the conversation is not the owner's
    async fn update_conversation(
        &self,
        id: &str,
        owner_id: &str,
        update: &ConversationUpdate,
    ) -> AppResult<Option<Conversation>>;

    /// Delete a conversation and all its messages; false when nothing matched
    async fn delete_conversation(&self, id: &str, owner_id: &str) -> AppResult<bool>;

    /// Append a message and bump the conversation's count in one transaction
    async fn append_message(&self, new: NewMessage) -> AppResult<Message>;

    /// All messages of a conversation in insertion order
    async fn get_messages(&self, conversation_id: &str) -> AppResult<Vec<Message>>;

    /// The newest `limit` messages, returned oldest first
    async fn get_recent_messages(&self, conversation_id: &str, limit: i64)
        -> AppResult<Vec<Message>>;

    /// Add to the running token total and return the new usage
    async fn add_token_usage(
        &self,
        conversation_id: &str,
        tokens: u64,
    ) -> AppResult<ConversationTokenUsage>;
}
