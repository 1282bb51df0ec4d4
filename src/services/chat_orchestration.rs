// ABOUTME: Streaming turn orchestration from prompt validation to token accounting
// ABOUTME: Relays upstream fragments to a sink in order and persists partial output on failure
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Streaming Orchestrator
//!
//! One call to [`StreamingOrchestrator::run_turn`] executes one conversational
//! turn:
//!
//! 1. validate the prompt and generation options
//! 2. resolve the caller's conversation or create one titled after the prompt
//! 3. count prompt tokens and persist the user message
//! 4. stream fragments from the generation client, awaiting the sink for each
//! 5. persist the accumulated text as the assistant message and accumulate
//!    the turn's tokens onto the conversation
//!
//! The conversation write lock is held around the user-message write and around
//! the assistant write plus accumulation, never while waiting on the model.
//!
//! Output already relayed is never thrown away: an upstream failure or a
//! cancellation after at least one chunk persists the partial text with
//! `complete = false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use super::conversation_locks::ConversationLocks;
use super::token_accountant::{TokenAccountant, TokenCount};
use crate::constants::{limits, orchestration};
use crate::database::{ConversationStore, NewConversation, NewMessage};
use crate::errors::{AppError, ErrorCode};
use crate::llm::{ChatMessage, GenerationClient, GenerationConfig};
use crate::models::{derive_title, Conversation, Message, MessageRole};

/// Tunables for [`StreamingOrchestrator`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Prior messages sent upstream with each turn
    pub history_limit: i64,
    /// Longest wait for the next fragment before the stream counts as failed
    pub stream_idle_timeout: Duration,
    /// Pause before the single assistant-write retry
    pub assistant_retry_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_limit: orchestration::DEFAULT_HISTORY_LIMIT,
            stream_idle_timeout: Duration::from_secs(orchestration::STREAM_IDLE_TIMEOUT_SECS),
            assistant_retry_backoff: Duration::from_millis(
                orchestration::ASSISTANT_RETRY_BACKOFF_MS,
            ),
        }
    }
}

/// Input for one turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Caller identity; conversations are scoped to it
    pub owner_id: String,
    /// New user prompt
    pub prompt: String,
    /// Existing conversation to continue, or `None` to start one
    pub conversation_id: Option<String>,
    /// Sampling options forwarded upstream
    pub config: GenerationConfig,
}

/// Emitted once the user message is committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnStarted {
    /// Conversation the turn belongs to
    pub conversation_id: String,
    /// Persisted user message
    pub user_message_id: String,
    /// True when the conversation was created by this turn
    pub created: bool,
}

/// One relayed fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkEvent {
    /// Fragment text
    pub chunk: String,
    /// All text relayed so far, this chunk included
    pub accumulated: String,
    /// 1-based, strictly increasing
    pub sequence: u64,
}

/// The consumer of a turn went away
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("turn consumer disconnected")]
pub struct SinkClosed;

/// Receives turn progress; awaited before the next fragment is requested
#[async_trait]
pub trait TurnSink: Send {
    /// Called once after the user message is persisted
    async fn on_start(&mut self, started: &TurnStarted) -> Result<(), SinkClosed>;

    /// Called once per fragment, in upstream order
    async fn on_chunk(&mut self, event: ChunkEvent) -> Result<(), SinkClosed>;
}

/// How a turn that produced a result ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Upstream finished normally
    Complete,
    /// Caller cancelled or disconnected
    Cancelled,
}

/// Token usage of one turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnUsage {
    /// Tokens of the user prompt
    pub prompt: u64,
    /// Tokens of the generated text
    pub completion: u64,
    /// Sum of both
    pub total: u64,
}

impl TurnUsage {
    const fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// Outcome of a turn that reached a terminal state without error
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    /// Conversation the turn belongs to
    pub conversation_id: String,
    /// Persisted user message
    pub user_message_id: String,
    /// Persisted assistant message; absent when cancelled before any chunk
    pub assistant_message_id: Option<String>,
    /// Complete or cancelled
    pub status: TurnStatus,
    /// Tokens charged for the turn
    pub token_usage: TurnUsage,
    /// Prompt count came from the model rather than the estimator
    pub prompt_tokens_exact: bool,
    /// Completion count came from the model rather than the estimator
    pub completion_tokens_exact: bool,
    /// Number of chunks relayed to the sink
    pub chunk_count: u64,
}

/// A failed turn together with what it already consumed
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct TurnError {
    /// Failure surfaced to the caller
    #[source]
    pub error: AppError,
    /// Tokens consumed before the failure, charged by admission control
    pub usage: TurnUsage,
}

impl TurnError {
    fn before_persistence(error: AppError) -> Self {
        Self {
            error,
            usage: TurnUsage::default(),
        }
    }
}

impl From<TurnError> for AppError {
    fn from(error: TurnError) -> Self {
        error.error
    }
}

enum StreamOutcome {
    Finished,
    Cancelled,
    Failed(AppError),
}

/// Merge turn bookkeeping into an error's details object
fn with_turn_details(mut error: AppError, details: Value) -> AppError {
    match (&mut error.details, details) {
        (Value::Object(existing), Value::Object(extra)) => existing.extend(extra),
        (slot, extra) => *slot = extra,
    }
    error
}

fn as_persistence_failure(error: AppError, what: &str) -> AppError {
    if error.code == ErrorCode::DatabaseError {
        error
    } else {
        AppError::database(format!("Failed to persist {what}: {}", error.message))
            .with_source(error)
    }
}

/// Executes conversational turns end to end
pub struct StreamingOrchestrator {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn GenerationClient>,
    accountant: Arc<TokenAccountant>,
    locks: ConversationLocks,
    settings: OrchestratorSettings,
}

impl StreamingOrchestrator {
    /// Wire the orchestrator to its collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn GenerationClient>,
        accountant: Arc<TokenAccountant>,
        locks: ConversationLocks,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            client,
            accountant,
            locks,
            settings,
        }
    }

    /// Token accountant used for counting
    #[must_use]
    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    /// Execute one turn.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` / `ValueOutOfRange` for an empty or oversized prompt or
    ///   bad options; nothing is persisted
    /// - `ResourceNotFound` when `conversation_id` is not the caller's; nothing
    ///   is persisted
    /// - `DatabaseError` when the user message cannot be written (no upstream
    ///   call is made) or the assistant message fails twice
    /// - upstream error codes when the model call fails; partial output is
    ///   persisted first when any chunk was relayed
    #[instrument(
        skip_all,
        fields(
            owner_id = %request.owner_id,
            conversation_id = tracing::field::Empty,
            chunk_count = tracing::field::Empty,
        )
    )]
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, TurnError> {
        validate_prompt(&request.prompt).map_err(TurnError::before_persistence)?;
        request
            .config
            .validate()
            .map_err(TurnError::before_persistence)?;

        let (conversation, created) = self
            .resolve_conversation(&request)
            .await
            .map_err(TurnError::before_persistence)?;
        let conversation_id = conversation.id.clone();
        Span::current().record("conversation_id", conversation_id.as_str());

        let mut upstream_prompt = if created {
            Vec::new()
        } else {
            self.history(&conversation_id)
                .await
                .map_err(TurnError::before_persistence)?
        };
        upstream_prompt.push(ChatMessage::user(request.prompt.clone()));

        let prompt_count = self.accountant.count(&request.prompt).await;
        let user_message = self
            .persist_user_message(&conversation, created, &request, prompt_count)
            .await
            .map_err(TurnError::before_persistence)?;

        let mut turn = TurnState {
            conversation_id,
            user_message_id: user_message.id.clone(),
            prompt: prompt_count,
            accumulated: String::new(),
            chunk_count: 0,
        };

        let started = TurnStarted {
            conversation_id: turn.conversation_id.clone(),
            user_message_id: turn.user_message_id.clone(),
            created,
        };
        let outcome = if sink.on_start(&started).await.is_err() {
            StreamOutcome::Cancelled
        } else {
            self.relay(&upstream_prompt, &request.config, sink, cancel, &mut turn)
                .await
        };

        Span::current().record("chunk_count", turn.chunk_count);
        self.finish(turn, outcome).await
    }

    async fn resolve_conversation(
        &self,
        request: &TurnRequest,
    ) -> Result<(Conversation, bool), AppError> {
        if let Some(id) = request.conversation_id.as_deref() {
            let conversation = self
                .store
                .get_conversation(id, &request.owner_id)
                .await?
                .ok_or_else(|| AppError::not_found("Conversation"))?;
            return Ok((conversation, false));
        }

        let conversation = self
            .store
            .create_conversation(NewConversation {
                owner_id: request.owner_id.clone(),
                title: derive_title(&request.prompt),
                tags: std::collections::BTreeSet::new(),
            })
            .await
            .map_err(|e| as_persistence_failure(e, "conversation"))?;
        info!(conversation_id = %conversation.id, "Created conversation for turn");
        Ok((conversation, true))
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, AppError> {
        if self.settings.history_limit <= 0 {
            return Ok(Vec::new());
        }
        let messages = self
            .store
            .get_recent_messages(conversation_id, self.settings.history_limit)
            .await?;
        Ok(messages
            .into_iter()
            .map(|message| ChatMessage {
                role: message.role,
                content: message.content,
            })
            .collect())
    }

    async fn persist_user_message(
        &self,
        conversation: &Conversation,
        created: bool,
        request: &TurnRequest,
        prompt_count: TokenCount,
    ) -> Result<Message, AppError> {
        let written = {
            let _guard = self.locks.acquire(&conversation.id).await;
            self.store
                .append_message(NewMessage::text(
                    &conversation.id,
                    MessageRole::User,
                    &request.prompt,
                    prompt_count.value,
                    true,
                ))
                .await
        };

        match written {
            Ok(message) => Ok(message),
            Err(e) => {
                error!(error = %e, "User message write failed, aborting before upstream call");
                if created {
                    if let Err(cleanup) = self
                        .store
                        .delete_conversation(&conversation.id, &conversation.owner_id)
                        .await
                    {
                        warn!(error = %cleanup, "Failed to remove empty conversation");
                    }
                }
                Err(as_persistence_failure(e, "user message"))
            }
        }
    }

    async fn relay(
        &self,
        prompt: &[ChatMessage],
        config: &GenerationConfig,
        sink: &mut dyn TurnSink,
        cancel: &CancellationToken,
        turn: &mut TurnState,
    ) -> StreamOutcome {
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamOutcome::Cancelled,
            opened = self.client.generate_stream(prompt, config) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return StreamOutcome::Failed(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return StreamOutcome::Cancelled,
                next = tokio::time::timeout(
                    self.settings.stream_idle_timeout,
                    stream.next(),
                ) => next,
            };

            let fragment = match next {
                Ok(Some(Ok(fragment))) => fragment,
                Ok(Some(Err(e))) => return StreamOutcome::Failed(e),
                Ok(None) => return StreamOutcome::Finished,
                Err(_) => {
                    return StreamOutcome::Failed(AppError::upstream(format!(
                        "No output from {} for {}s",
                        self.client.name(),
                        self.settings.stream_idle_timeout.as_secs()
                    )))
                }
            };
            if fragment.text.is_empty() {
                continue;
            }

            turn.accumulated.push_str(&fragment.text);
            turn.chunk_count += 1;
            let event = ChunkEvent {
                chunk: fragment.text,
                accumulated: turn.accumulated.clone(),
                sequence: turn.chunk_count,
            };

            let delivered = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(SinkClosed),
                delivered = sink.on_chunk(event) => delivered,
            };
            if delivered.is_err() {
                debug!(chunk_count = turn.chunk_count, "Turn consumer gone, stopping relay");
                return StreamOutcome::Cancelled;
            }
        }
    }

    async fn finish(
        &self,
        turn: TurnState,
        outcome: StreamOutcome,
    ) -> Result<TurnResult, TurnError> {
        let complete = matches!(outcome, StreamOutcome::Finished);
        let has_output = complete || turn.chunk_count > 0;

        let completion = if has_output {
            self.accountant.count(&turn.accumulated).await
        } else {
            TokenCount {
                value: 0,
                exact: true,
            }
        };
        let consumed = TurnUsage::new(turn.prompt.value, completion.value);

        let guard = self.locks.acquire(&turn.conversation_id).await;

        let assistant = if has_output {
            match self.persist_assistant(&turn, completion.value, complete).await {
                Ok(message) => Some(message),
                Err(e) => {
                    // The user message is committed; keep the totals in step with it
                    if let Err(acc) = self
                        .accountant
                        .accumulate_locked(&guard, turn.prompt.value)
                        .await
                    {
                        error!(
                            error = %acc,
                            "Token accumulation failed after assistant write failure"
                        );
                    }
                    let error = with_turn_details(
                        as_persistence_failure(e, "assistant message"),
                        json!({
                            "conversation_id": turn.conversation_id,
                            "user_message_id": turn.user_message_id,
                            "chunk_count": turn.chunk_count,
                        }),
                    );
                    return Err(TurnError {
                        error,
                        usage: consumed,
                    });
                }
            }
        } else {
            None
        };

        let committed = if assistant.is_some() {
            consumed
        } else {
            TurnUsage::new(turn.prompt.value, 0)
        };
        let accumulated = self
            .accountant
            .accumulate_locked(&guard, committed.total)
            .await;
        drop(guard);

        let assistant_message_id = assistant.map(|message| message.id);
        let details = json!({
            "conversation_id": turn.conversation_id,
            "user_message_id": turn.user_message_id,
            "assistant_message_id": assistant_message_id,
            "chunk_count": turn.chunk_count,
            "partial": !complete,
        });

        if let Err(e) = accumulated {
            error!(error = %e, "Token accumulation failed");
            return Err(TurnError {
                error: with_turn_details(as_persistence_failure(e, "token usage"), details),
                usage: committed,
            });
        }

        let status = match outcome {
            StreamOutcome::Finished => TurnStatus::Complete,
            StreamOutcome::Cancelled => {
                info!(chunk_count = turn.chunk_count, "Turn cancelled");
                TurnStatus::Cancelled
            }
            StreamOutcome::Failed(e) => {
                warn!(error = %e, chunk_count = turn.chunk_count, "Upstream stream failed");
                return Err(TurnError {
                    error: with_turn_details(e, details),
                    usage: committed,
                });
            }
        };

        info!(
            chunk_count = turn.chunk_count,
            tokens = committed.total,
            status = ?status,
            "Turn finished"
        );

        Ok(TurnResult {
            conversation_id: turn.conversation_id,
            user_message_id: turn.user_message_id,
            assistant_message_id,
            status,
            token_usage: committed,
            prompt_tokens_exact: turn.prompt.exact,
            completion_tokens_exact: completion.exact,
            chunk_count: turn.chunk_count,
        })
    }

    async fn persist_assistant(
        &self,
        turn: &TurnState,
        tokens: u64,
        complete: bool,
    ) -> Result<Message, AppError> {
        let message = NewMessage::text(
            &turn.conversation_id,
            MessageRole::Assistant,
            &turn.accumulated,
            tokens,
            complete,
        );

        match self.store.append_message(message.clone()).await {
            Ok(saved) => Ok(saved),
            Err(first) => {
                warn!(
                    error = %first,
                    backoff_ms = self.settings.assistant_retry_backoff.as_millis() as u64,
                    "Assistant message write failed, retrying once"
                );
                tokio::time::sleep(self.settings.assistant_retry_backoff).await;
                self.store.append_message(message).await
            }
        }
    }
}

struct TurnState {
    conversation_id: String,
    user_message_id: String,
    prompt: TokenCount,
    accumulated: String,
    chunk_count: u64,
}

/// Reject an empty prompt or one longer than [`limits::MAX_PROMPT_CHARS`] characters
///
/// # Errors
///
/// Returns `InvalidInput` describing the violation.
pub fn validate_prompt(prompt: &str) -> Result<(), AppError> {
    if prompt.is_empty() {
        return Err(AppError::invalid_input("Prompt must not be empty"));
    }
    let chars = prompt.chars().count();
    if chars > limits::MAX_PROMPT_CHARS {
        return Err(AppError::invalid_input(format!(
            "Prompt is {chars} characters; the limit is {}",
            limits::MAX_PROMPT_CHARS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_bounds() {
        assert!(validate_prompt("").is_err());
        assert!(validate_prompt("   ").is_ok());
        assert!(validate_prompt(&"a".repeat(limits::MAX_PROMPT_CHARS)).is_ok());
        assert!(validate_prompt(&"a".repeat(limits::MAX_PROMPT_CHARS + 1)).is_err());
    }

    #[test]
    fn test_turn_details_merge_into_existing_object() {
        let error =
            AppError::upstream("blocked").with_details(json!({ "finish_reason": "SAFETY" }));
        let merged = with_turn_details(error, json!({ "chunk_count": 2 }));
        assert_eq!(merged.details["finish_reason"], "SAFETY");
        assert_eq!(merged.details["chunk_count"], 2);
    }

    #[test]
    fn test_non_database_write_errors_become_persistence_failures() {
        let error =
            as_persistence_failure(AppError::not_found("Conversation"), "assistant message");
        assert_eq!(error.code, ErrorCode::DatabaseError);
    }
}
