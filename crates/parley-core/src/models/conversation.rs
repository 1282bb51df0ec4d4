// ABOUTME: Conversation and message record types shared by the store and the API
// ABOUTME: Includes title derivation and tag normalization rules
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{limits, tokens};
use crate::errors::{AppError, AppResult};

/// Role of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Caller prompt
    User,
    /// Generated response
    Assistant,
}

impl MessageRole {
    /// Convert to string representation for storage
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(AppError::invalid_input(format!(
                "Unknown message role: {other}"
            ))),
        }
    }
}

/// Content type of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text
    #[default]
    Text,
    /// Image attachment
    Image,
    /// Voice recording
    Voice,
    /// Mixed content
    Multimodal,
    /// PDF document
    Pdf,
}

impl MessageType {
    /// Convert to string representation for storage
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Multimodal => "multimodal",
            Self::Pdf => "pdf",
        }
    }
}

impl FromStr for MessageType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "voice" => Ok(Self::Voice),
            "multimodal" => Ok(Self::Multimodal),
            "pdf" => Ok(Self::Pdf),
            other => Err(AppError::invalid_input(format!(
                "Unknown message type: {other}"
            ))),
        }
    }
}

/// Reference to content stored outside the message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment kind (image, voice, pdf, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Where the content lives (URL or storage key)
    pub locator: String,
    /// Display name
    pub name: String,
}

/// Running token total for a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationTokenUsage {
    /// Sum of all owned messages' token counts
    pub total: u64,
    /// `total` multiplied by the fixed per-token cost
    pub estimated_cost: f64,
}

impl ConversationTokenUsage {
    /// Build usage from a token total, deriving the estimated cost
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_total(total: u64) -> Self {
        Self {
            total,
            estimated_cost: total as f64 * tokens::COST_PER_TOKEN,
        }
    }
}

/// A multi-turn conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: String,
    /// Owner; immutable after creation
    pub owner_id: String,
    /// Display title
    pub title: String,
    /// Normalized tag set
    pub tags: BTreeSet<String>,
    /// Message ids in insertion order
    pub message_ids: Vec<String>,
    /// Running token usage
    pub token_usage: ConversationTokenUsage,
    /// Hidden from default listings
    pub archived: bool,
    /// Listed before unpinned conversations
    pub pinned: bool,
    /// Timestamp of the newest message (ISO 8601)
    pub last_message_at: Option<String>,
    /// Number of owned messages
    pub message_count: u64,
    /// When the conversation was created (ISO 8601)
    pub created_at: String,
    /// When the conversation was last updated (ISO 8601)
    pub updated_at: String,
}

/// A single append-only conversation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Sender role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Content type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Ordered attachment references
    pub attachments: Vec<Attachment>,
    /// Token count charged for this message
    pub tokens: u64,
    /// False for assistant output cut short by an upstream failure or cancellation
    pub complete: bool,
    /// When the message was created (ISO 8601)
    pub created_at: String,
}

/// Summary of a conversation for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation ID
    pub id: String,
    /// Conversation title
    pub title: String,
    /// Normalized tag set
    pub tags: BTreeSet<String>,
    /// Pinned flag
    pub pinned: bool,
    /// Archived flag
    pub archived: bool,
    /// Number of messages in the conversation
    pub message_count: u64,
    /// Running token usage
    pub token_usage: ConversationTokenUsage,
    /// Timestamp of the newest message
    pub last_message_at: Option<String>,
    /// When the conversation was last updated
    pub updated_at: String,
}

/// Derive a conversation title from the first prompt.
///
/// Line breaks and runs of whitespace collapse to single spaces and the
/// result is cut to [`limits::TITLE_MAX_CHARS`] characters. A prompt with no
/// printable content gets [`limits::DEFAULT_CONVERSATION_TITLE`].
#[must_use]
pub fn derive_title(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return limits::DEFAULT_CONVERSATION_TITLE.to_owned();
    }

    let truncated: String = collapsed.chars().take(limits::TITLE_MAX_CHARS).collect();
    truncated.trim_end().to_owned()
}

/// Normalize and validate a tag list into a set.
///
/// Tags are trimmed and lowercased; blanks are dropped and duplicates merge.
///
/// # Errors
///
/// Returns `InvalidInput` if more than [`limits::MAX_TAGS`] distinct tags remain
/// or any tag exceeds [`limits::MAX_TAG_CHARS`] characters.
pub fn normalize_tags<I, S>(tags: I) -> AppResult<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = BTreeSet::new();
    for tag in tags {
        let tag = tag.as_ref().trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.chars().count() > limits::MAX_TAG_CHARS {
            return Err(AppError::invalid_input(format!(
                "Tag '{tag}' exceeds {} characters",
                limits::MAX_TAG_CHARS
            )));
        }
        normalized.insert(tag);
    }

    if normalized.len() > limits::MAX_TAGS {
        return Err(AppError::invalid_input(format!(
            "At most {} tags are allowed",
            limits::MAX_TAGS
        )));
    }

    Ok(normalized)
}
