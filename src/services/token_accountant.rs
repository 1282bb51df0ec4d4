// ABOUTME: Token counting with estimator fallback and per-conversation running totals
// ABOUTME: Accumulation is serialized through the shared conversation write locks
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::conversation_locks::{ConversationLocks, ConversationWriteGuard};
use crate::constants::tokens;
use crate::database::ConversationStore;
use crate::errors::AppResult;
use crate::llm::GenerationClient;
use crate::models::ConversationTokenUsage;

/// Result of counting tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    /// Number of tokens
    pub value: u64,
    /// False when produced by the heuristic estimator
    pub exact: bool,
}

impl TokenCount {
    /// Heuristic count: one token per five characters, rounded up, plus a fixed overhead
    #[must_use]
    pub fn estimate(text: &str) -> Self {
        let chars = text.chars().count();
        let value =
            chars.div_ceil(tokens::ESTIMATOR_CHARS_PER_TOKEN) as u64 + tokens::ESTIMATOR_OVERHEAD;
        Self {
            value,
            exact: false,
        }
    }
}

/// Counts tokens and maintains per-conversation running totals
pub struct TokenAccountant {
    client: Arc<dyn GenerationClient>,
    store: Arc<dyn ConversationStore>,
    locks: ConversationLocks,
}

impl TokenAccountant {
    /// Build an accountant over the given client, store, and lock map
    #[must_use]
    pub fn new(
        client: Arc<dyn GenerationClient>,
        store: Arc<dyn ConversationStore>,
        locks: ConversationLocks,
    ) -> Self {
        Self {
            client,
            store,
            locks,
        }
    }

    /// Count tokens remotely, falling back to the estimator on any failure
    pub async fn count(&self, content: &str) -> TokenCount {
        match self.client.count_tokens(content).await {
            Ok(value) => TokenCount { value, exact: true },
            Err(e) => {
                let estimate = TokenCount::estimate(content);
                warn!(
                    error = %e,
                    estimate = estimate.value,
                    client = self.client.name(),
                    "Token count failed, using estimate"
                );
                estimate
            }
        }
    }

    /// Add `tokens` to a conversation's running total
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the conversation no longer exists, or a
    /// database error if the update fails.
    pub async fn accumulate(
        &self,
        conversation_id: &str,
        tokens: u64,
    ) -> AppResult<ConversationTokenUsage> {
        let guard = self.locks.acquire(conversation_id).await;
        self.accumulate_locked(&guard, tokens).await
    }

    /// Same as [`Self::accumulate`] for a caller already holding the write guard
    ///
    /// # Errors
    ///
    /// See [`Self::accumulate`].
    pub async fn accumulate_locked(
        &self,
        guard: &ConversationWriteGuard,
        tokens: u64,
    ) -> AppResult<ConversationTokenUsage> {
        let conversation_id = guard.conversation_id();
        let usage = self.store.add_token_usage(conversation_id, tokens).await?;

        debug!(
            conversation_id,
            tokens,
            total = usage.total,
            "Accumulated conversation tokens"
        );
        Ok(usage)
    }
}
