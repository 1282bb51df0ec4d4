// ABOUTME: Chat route handlers for streaming turns and conversation management
// ABOUTME: Bridges orchestrator turns onto SSE responses with admission control up front
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Chat routes
//!
//! The caller's owner id arrives in the `x-owner-id` header, set by the
//! authenticating gateway in front of this service. Requests without it share
//! the anonymous identity.
//!
//! A turn runs on its own task. Events travel to the SSE response over a
//! channel of capacity one, so the orchestrator cannot run ahead of a slow
//! client, and a dropped response cancels the turn.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::database::{ConversationPatch, ConversationUpdate, ListQuery};
use crate::errors::{AppError, AppResult};
use crate::llm::{ChatMessage, GenerationConfig};
use crate::models::{Conversation, ConversationSummary, Message};
use crate::rate_limiting::{AdmissionDecision, Identity};
use crate::server::ServerResources;
use crate::services::{
    validate_prompt, ChunkEvent, SinkClosed, TurnRequest, TurnResult, TurnSink, TurnStarted,
    TurnUsage,
};

/// Header carrying the caller's owner id
pub const OWNER_ID_HEADER: &str = "x-owner-id";

const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

// ============================================================================
// Request / Response Types
// ============================================================================

/// Body of `POST /api/chat/turns`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnBody {
    /// New user prompt
    pub prompt: String,
    /// Conversation to continue
    #[serde(default, alias = "conversation_id")]
    pub conversation_id: Option<String>,
    /// Generation options
    #[serde(default)]
    pub config: GenerationConfig,
}

/// Body of `POST /api/chat/generate`
#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    /// Prompt text
    pub prompt: String,
    /// Generation options
    #[serde(default)]
    pub config: GenerationConfig,
}

/// Response of `POST /api/chat/generate`
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    /// Generated text
    pub text: String,
    /// Model that produced it
    pub model: String,
    /// Tokens charged
    pub token_usage: TurnUsage,
}

/// Response of `GET /api/chat/conversations`
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    /// Page of conversations
    pub conversations: Vec<ConversationSummary>,
    /// Number of entries in this page
    pub total: usize,
}

/// Response of `GET /api/chat/conversations/:id`
#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    /// The conversation
    pub conversation: Conversation,
    /// Its messages in insertion order
    pub messages: Vec<Message>,
}

// ============================================================================
// Turn events
// ============================================================================

/// Progress of a turn as sent to the SSE response
#[derive(Debug)]
enum TurnEvent {
    Started(TurnStarted),
    Chunk(ChunkEvent),
    Ended(TurnResult),
    Failed(AppError),
}

impl TurnEvent {
    const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended(_) | Self::Failed(_))
    }

    fn into_sse(self) -> Event {
        let (kind, payload) = match self {
            Self::Started(started) => (
                "start",
                json!({
                    "type": "start",
                    "conversation_id": started.conversation_id,
                    "user_message_id": started.user_message_id,
                    "created": started.created,
                }),
            ),
            Self::Chunk(chunk) => (
                "chunk",
                json!({
                    "type": "chunk",
                    "chunk": chunk.chunk,
                    "accumulated": chunk.accumulated,
                    "sequence": chunk.sequence,
                }),
            ),
            Self::Ended(result) => (
                "end",
                json!({
                    "type": "end",
                    "conversation_id": result.conversation_id,
                    "assistant_message_id": result.assistant_message_id,
                    "status": result.status,
                    "chunk_count": result.chunk_count,
                    "token_usage": result.token_usage,
                }),
            ),
            Self::Failed(error) => ("error", error_payload(&error)),
        };
        Event::default().event(kind).data(payload.to_string())
    }
}

fn error_payload(error: &AppError) -> Value {
    let mut payload = json!({
        "type": "error",
        "code": error.code,
        "message": error.message,
        "details": error.details,
    });
    if let (Some(retry_after_ms), Value::Object(map)) = (error.retry_after_ms, &mut payload) {
        map.insert("retry_after_ms".into(), json!(retry_after_ms));
    }
    payload
}

/// Forwards orchestrator progress into the response channel
struct ChannelSink {
    events: mpsc::Sender<TurnEvent>,
}

#[async_trait]
impl TurnSink for ChannelSink {
    async fn on_start(&mut self, started: &TurnStarted) -> Result<(), SinkClosed> {
        self.events
            .send(TurnEvent::Started(started.clone()))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn on_chunk(&mut self, event: ChunkEvent) -> Result<(), SinkClosed> {
        self.events
            .send(TurnEvent::Chunk(event))
            .await
            .map_err(|_| SinkClosed)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn identity(headers: &HeaderMap) -> AppResult<Identity> {
    let owner_id = match headers.get(OWNER_ID_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| AppError::invalid_input("Owner id must be visible ASCII"))?,
        ),
        None => None,
    };
    Identity::from_owner(owner_id)
}

fn rate_limit_headers(decision: &AdmissionDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    // Disabled limiting reports no ceiling
    if decision.limit == u32::MAX {
        return headers;
    }
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
    headers
}

/// Admit the caller, or build the 429 response
fn admit(resources: &ServerResources, identity: &Identity) -> Result<AdmissionDecision, Response> {
    let decision = resources.admission.admit(identity);
    decision.into_result().map_err(|error| {
        info!(
            identity = %identity.key(),
            code = error.code.as_str(),
            retry_after_ms = error.retry_after_ms,
            "Request refused by admission control"
        );
        (rate_limit_headers(&decision), error).into_response()
    })
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::invalid_input(rejection.body_text()))
}

/// Request bodies that carry a prompt and generation options
trait PromptBody {
    fn prompt(&self) -> &str;
    fn config(&self) -> &GenerationConfig;
}

impl PromptBody for TurnBody {
    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn config(&self) -> &GenerationConfig {
        &self.config
    }
}

impl PromptBody for GenerateBody {
    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn config(&self) -> &GenerationConfig {
        &self.config
    }
}

/// Resolve the caller and validate the body without touching any state
fn checked_request<T: PromptBody>(
    headers: &HeaderMap,
    body: Result<Json<T>, JsonRejection>,
) -> AppResult<(Identity, T)> {
    let identity = identity(headers)?;
    let body = json_body(body)?;
    validate_prompt(body.prompt())?;
    body.config().validate()?;
    Ok((identity, body))
}

// ============================================================================
// Chat Routes
// ============================================================================

/// Chat routes handler
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create all chat routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/chat/turns", post(Self::start_turn))
            .route("/api/chat/generate", post(Self::generate))
            .route("/api/chat/conversations", get(Self::list_conversations))
            .route(
                "/api/chat/conversations/:conversation_id",
                get(Self::get_conversation)
                    .patch(Self::update_conversation)
                    .delete(Self::delete_conversation),
            )
            .with_state(resources)
    }

    // ========================================================================
    // Turn Handlers
    // ========================================================================

    /// Start a turn and stream its progress via SSE
    ///
    /// The request is validated before admission. A turn rejected before its
    /// user message is committed gives its request slot back.
    async fn start_turn(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        body: Result<Json<TurnBody>, JsonRejection>,
    ) -> Response {
        let (identity, body) = match checked_request(&headers, body) {
            Ok(checked) => checked,
            Err(error) => return error.into_response(),
        };
        let decision = match admit(&resources, &identity) {
            Ok(decision) => decision,
            Err(refused) => return refused,
        };

        match Self::open_turn(resources.clone(), identity.clone(), body).await {
            Ok(stream) => (rate_limit_headers(&decision), stream).into_response(),
            Err(error) => {
                resources.admission.release(&identity);
                error.into_response()
            }
        }
    }

    /// Spawn the turn and wait for its first event. Failures before the user
    /// message is committed come back as plain JSON errors.
    async fn open_turn(
        resources: Arc<ServerResources>,
        identity: Identity,
        body: TurnBody,
    ) -> AppResult<Response> {
        let request = TurnRequest {
            owner_id: identity.owner_id().to_owned(),
            prompt: body.prompt,
            conversation_id: body.conversation_id,
            config: body.config,
        };

        let (events, receiver) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let turn_cancel = cancel.clone();
        let orchestrator = resources.orchestrator.clone();
        let admission = resources.admission.clone();

        tokio::spawn(async move {
            let mut sink = ChannelSink {
                events: events.clone(),
            };
            let (terminal, usage) = match orchestrator
                .run_turn(request, &mut sink, &turn_cancel)
                .await
            {
                Ok(result) => {
                    let usage = result.token_usage;
                    (TurnEvent::Ended(result), usage)
                }
                Err(failure) => (TurnEvent::Failed(failure.error), failure.usage),
            };
            admission.report(&identity, usage.total);

            if events.send(terminal).await.is_err() {
                debug!("Client disconnected before the terminal event");
            }
        });

        let mut receiver = ReceiverStream::new(receiver);
        let first = match receiver.next().await {
            Some(TurnEvent::Failed(error)) => return Err(error),
            Some(event) => event,
            None => return Err(AppError::internal("Turn ended without a result")),
        };

        let cancel_on_drop = cancel.drop_guard();
        let mut events = tokio_stream::once(first).chain(receiver);
        let stream = async_stream::stream! {
            let _cancel_on_drop = cancel_on_drop;
            while let Some(event) = events.next().await {
                let terminal = event.is_terminal();
                yield Ok::<_, Infallible>(event.into_sse());
                if terminal {
                    return;
                }
            }
            let lost = AppError::internal("Turn ended without a terminal event");
            yield Ok(TurnEvent::Failed(lost).into_sse());
        };

        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response())
    }

    /// One-shot generation without conversation state
    async fn generate(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        body: Result<Json<GenerateBody>, JsonRejection>,
    ) -> Response {
        let (identity, body) = match checked_request(&headers, body) {
            Ok(checked) => checked,
            Err(error) => return error.into_response(),
        };
        let decision = match admit(&resources, &identity) {
            Ok(decision) => decision,
            Err(refused) => return refused,
        };

        match Self::run_generate(&resources, &identity, body).await {
            Ok(response) => (rate_limit_headers(&decision), Json(response)).into_response(),
            Err(error) => error.into_response(),
        }
    }

    async fn run_generate(
        resources: &ServerResources,
        identity: &Identity,
        body: GenerateBody,
    ) -> AppResult<GenerateResponse> {
        let prompt_tokens = resources.accountant.count(&body.prompt).await;
        let generated = resources
            .client
            .generate(&[ChatMessage::user(body.prompt)], &body.config)
            .await;
        let text = match generated {
            Ok(text) => text,
            Err(e) => {
                resources.admission.report(identity, prompt_tokens.value);
                return Err(e);
            }
        };

        let completion_tokens = resources.accountant.count(&text).await;
        let token_usage = TurnUsage {
            prompt: prompt_tokens.value,
            completion: completion_tokens.value,
            total: prompt_tokens.value + completion_tokens.value,
        };
        resources.admission.report(identity, token_usage.total);

        Ok(GenerateResponse {
            text,
            model: resources.client.model().to_owned(),
            token_usage,
        })
    }

    // ========================================================================
    // Conversation Handlers
    // ========================================================================

    /// List the caller's conversations
    async fn list_conversations(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        query: Result<Query<ListQuery>, QueryRejection>,
    ) -> Result<Json<ConversationListResponse>, AppError> {
        let identity = identity(&headers)?;
        let Query(query) =
            query.map_err(|rejection| AppError::invalid_input(rejection.body_text()))?;

        let conversations = resources
            .store
            .list_conversations(identity.owner_id(), query.clamped())
            .await?;

        Ok(Json(ConversationListResponse {
            total: conversations.len(),
            conversations,
        }))
    }

    /// Get a conversation with its messages
    async fn get_conversation(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(conversation_id): Path<String>,
    ) -> Result<Json<ConversationDetailResponse>, AppError> {
        let identity = identity(&headers)?;
        let conversation = resources
            .store
            .get_conversation(&conversation_id, identity.owner_id())
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;
        let messages = resources.store.get_messages(&conversation.id).await?;

        Ok(Json(ConversationDetailResponse {
            conversation,
            messages,
        }))
    }

    /// Update title, tags, pinned, or archived
    async fn update_conversation(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(conversation_id): Path<String>,
        body: Result<Json<ConversationPatch>, JsonRejection>,
    ) -> Result<Json<Conversation>, AppError> {
        let identity = identity(&headers)?;
        let update = ConversationUpdate::from_patch(json_body(body)?)?;

        let conversation = resources
            .store
            .update_conversation(&conversation_id, identity.owner_id(), &update)
            .await?
            .ok_or_else(|| AppError::not_found("Conversation"))?;

        Ok(Json(conversation))
    }

    /// Delete a conversation and its messages
    async fn delete_conversation(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Path(conversation_id): Path<String>,
    ) -> Result<StatusCode, AppError> {
        let identity = identity(&headers)?;
        if resources
            .store
            .delete_conversation(&conversation_id, identity.owner_id())
            .await?
        {
            info!(conversation_id = %conversation_id, "Conversation deleted");
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(AppError::not_found("Conversation"))
        }
    }
}
