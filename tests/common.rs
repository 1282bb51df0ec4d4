// ABOUTME: Shared test utilities and setup functions for integration tests
// ABOUTME: Provides in-memory stores, a scripted generation client, and a fault-injecting store
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence
#![allow(
    dead_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::unwrap_used,
    clippy::expect_used
)]
//! Shared test utilities for `parley_server`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use parley_server::{
    config::environment::{
        DatabaseConfig, LlmConfig, OrchestratorConfig, RateLimitConfig, ServerConfig,
    },
    database::{
        ConversationStore, ConversationUpdate, ListQuery, NewConversation, NewMessage,
        SqliteConversationStore,
    },
    errors::{AppError, AppResult, ErrorCode},
    llm::{ChatMessage, Fragment, FragmentStream, GenerationClient, GenerationConfig},
    models::{Conversation, ConversationSummary, ConversationTokenUsage, Message, MessageRole},
    rate_limiting::PressureGauge,
    server::ServerResources,
    services::{
        ChunkEvent, ConversationLocks, OrchestratorSettings, SinkClosed, StreamingOrchestrator,
        TokenAccountant, TurnSink, TurnStarted,
    },
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };

        // Another test binary may already own the global subscriber
        let _ = tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .try_init();
    });
}

/// Fresh in-memory conversation store
pub async fn create_test_store() -> Arc<SqliteConversationStore> {
    init_test_logging();
    Arc::new(
        SqliteConversationStore::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory store"),
    )
}

// ============================================================================
// Scripted generation client
// ============================================================================

/// One step of a scripted stream
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a text fragment
    Text(String),
    /// Emit an error and end the stream
    Fail(ErrorCode, String),
    /// Never produce another item
    Stall,
}

/// Deterministic [`GenerationClient`] that replays a script
pub struct ScriptedClient {
    script: Vec<ScriptStep>,
    open_failure: Option<(ErrorCode, String)>,
    counting_fails: bool,
    pub stream_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub count_calls: AtomicUsize,
    pub last_prompt: Mutex<Vec<ChatMessage>>,
}

impl ScriptedClient {
    /// Client whose streams emit `chunks` and then end normally
    pub fn streaming<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: chunks
                .into_iter()
                .map(|chunk| ScriptStep::Text(chunk.into()))
                .collect(),
            open_failure: None,
            counting_fails: false,
            stream_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(Vec::new()),
        }
    }

    /// Fail the stream with `code` after the scripted chunks
    pub fn then_fail(mut self, code: ErrorCode, message: &str) -> Self {
        self.script.push(ScriptStep::Fail(code, message.to_owned()));
        self
    }

    /// Stop producing output after the scripted chunks without ending
    pub fn then_stall(mut self) -> Self {
        self.script.push(ScriptStep::Stall);
        self
    }

    /// Fail `generate_stream` itself
    pub fn failing_to_open(mut self, code: ErrorCode, message: &str) -> Self {
        self.open_failure = Some((code, message.to_owned()));
        self
    }

    /// Make every `count_tokens` call fail
    pub fn with_failing_counts(mut self) -> Self {
        self.counting_fails = true;
        self
    }

    /// Exact count reported by this client: one token per word plus one
    pub fn exact_count(content: &str) -> u64 {
        content.split_whitespace().count() as u64 + 1
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn full_text(&self) -> String {
        self.script
            .iter()
            .filter_map(|step| match step {
                ScriptStep::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(
        &self,
        prompt: &[ChatMessage],
        _config: &GenerationConfig,
    ) -> AppResult<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = prompt.to_vec();
        if let Some((code, message)) = &self.open_failure {
            return Err(AppError::new(*code, message.clone()));
        }
        Ok(self.full_text())
    }

    async fn generate_stream(
        &self,
        prompt: &[ChatMessage],
        _config: &GenerationConfig,
    ) -> AppResult<FragmentStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = prompt.to_vec();
        if let Some((code, message)) = &self.open_failure {
            return Err(AppError::new(*code, message.clone()));
        }

        let mut items = Vec::new();
        let mut stalls = false;
        for step in &self.script {
            match step {
                ScriptStep::Text(text) => items.push(Ok(Fragment::text(text.clone()))),
                ScriptStep::Fail(code, message) => {
                    items.push(Err(AppError::new(*code, message.clone())));
                    break;
                }
                ScriptStep::Stall => {
                    stalls = true;
                    break;
                }
            }
        }

        let replay = tokio_stream::iter(items);
        if stalls {
            Ok(Box::pin(replay.chain(tokio_stream::pending())))
        } else {
            Ok(Box::pin(replay))
        }
    }

    async fn count_tokens(&self, content: &str) -> AppResult<u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        if self.counting_fails {
            return Err(AppError::new(
                ErrorCode::ExternalServiceUnavailable,
                "count unavailable",
            ));
        }
        Ok(Self::exact_count(content))
    }
}

// ============================================================================
// Fault-injecting store
// ============================================================================

/// Store wrapper that counts writes and fails chosen message appends
pub struct FlakyStore {
    inner: Arc<dyn ConversationStore>,
    /// Upcoming user-message appends to fail
    pub fail_user_appends: AtomicUsize,
    /// Upcoming assistant-message appends to fail
    pub fail_assistant_appends: AtomicUsize,
    /// Every mutating call, successful or not
    pub writes: AtomicUsize,
    /// Assistant appends attempted
    pub assistant_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ConversationStore>) -> Self {
        Self {
            inner,
            fail_user_appends: AtomicUsize::new(0),
            fail_assistant_appends: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            assistant_attempts: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<Conversation> {
        self.record_write();
        self.inner.create_conversation(new).await
    }

    async fn get_conversation(&self, id: &str, owner_id: &str) -> AppResult<Option<Conversation>> {
        self.inner.get_conversation(id, owner_id).await
    }

    async fn list_conversations(
        &self,
        owner_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<ConversationSummary>> {
        self.inner.list_conversations(owner_id, query).await
    }

    async fn update_conversation(
        &self,
        id: &str,
        owner_id: &str,
        update: &ConversationUpdate,
    ) -> AppResult<Option<Conversation>> {
        self.record_write();
        self.inner.update_conversation(id, owner_id, update).await
    }

    async fn delete_conversation(&self, id: &str, owner_id: &str) -> AppResult<bool> {
        self.record_write();
        self.inner.delete_conversation(id, owner_id).await
    }

    async fn append_message(&self, new: NewMessage) -> AppResult<Message> {
        self.record_write();
        let failing = match new.role {
            MessageRole::User => Self::take_failure(&self.fail_user_appends),
            MessageRole::Assistant => {
                self.assistant_attempts.fetch_add(1, Ordering::SeqCst);
                Self::take_failure(&self.fail_assistant_appends)
            }
        };
        if failing {
            return Err(AppError::new(ErrorCode::DatabaseError, "injected write failure"));
        }
        self.inner.append_message(new).await
    }

    async fn get_messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        self.inner.get_messages(conversation_id).await
    }

    async fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        self.inner.get_recent_messages(conversation_id, limit).await
    }

    async fn add_token_usage(
        &self,
        conversation_id: &str,
        tokens: u64,
    ) -> AppResult<ConversationTokenUsage> {
        self.record_write();
        self.inner.add_token_usage(conversation_id, tokens).await
    }
}

// ============================================================================
// Orchestrator wiring
// ============================================================================

/// Settings with short timings for tests
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        history_limit: 20,
        stream_idle_timeout: Duration::from_millis(200),
        assistant_retry_backoff: Duration::from_millis(1),
    }
}

/// Orchestrator over the given store and client
pub fn create_orchestrator(
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn GenerationClient>,
) -> StreamingOrchestrator {
    let locks = ConversationLocks::new();
    let accountant = Arc::new(TokenAccountant::new(
        client.clone(),
        store.clone(),
        locks.clone(),
    ));
    StreamingOrchestrator::new(store, client, accountant, locks, test_settings())
}

/// Sink that records everything and can cancel after a number of chunks
#[derive(Default)]
pub struct RecordingSink {
    pub started: Option<TurnStarted>,
    pub chunks: Vec<ChunkEvent>,
    cancel_after: Option<(u64, CancellationToken)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` once `chunks` chunks have been received
    pub fn cancelling_after(chunks: u64, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((chunks, token)),
            ..Self::default()
        }
    }

    pub fn accumulated(&self) -> Vec<&str> {
        self.chunks
            .iter()
            .map(|chunk| chunk.accumulated.as_str())
            .collect()
    }
}

#[async_trait]
impl TurnSink for RecordingSink {
    async fn on_start(&mut self, started: &TurnStarted) -> Result<(), SinkClosed> {
        self.started = Some(started.clone());
        Ok(())
    }

    async fn on_chunk(&mut self, event: ChunkEvent) -> Result<(), SinkClosed> {
        let sequence = event.sequence;
        self.chunks.push(event);
        if let Some((after, token)) = &self.cancel_after {
            if sequence >= *after {
                token.cancel();
            }
        }
        Ok(())
    }
}

// ============================================================================
// Server wiring
// ============================================================================

/// Configuration for route tests with the given rate limits
pub fn test_server_config(rate_limit: RateLimitConfig) -> ServerConfig {
    ServerConfig {
        http_port: 0,
        database: DatabaseConfig {
            url: "sqlite::memory:".to_owned(),
        },
        llm: LlmConfig {
            api_key: None,
            model: None,
            stream_idle_timeout_secs: 5,
        },
        rate_limit,
        orchestrator: OrchestratorConfig {
            history_limit: 20,
            assistant_retry_backoff_ms: 1,
        },
    }
}

/// Server resources over an in-memory store and the given client
pub async fn create_test_server_resources(
    client: Arc<dyn GenerationClient>,
    rate_limit: RateLimitConfig,
) -> Arc<ServerResources> {
    let store = create_test_store().await;
    Arc::new(ServerResources::new(
        store,
        client,
        &test_server_config(rate_limit),
        Arc::new(PressureGauge::new()),
    ))
}
