// ABOUTME: Google Gemini implementation of the generation client
// ABOUTME: Covers one-shot generation, SSE streaming, and token counting over reqwest
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Gemini Generation Client
//!
//! Talks to the Generative Language REST API:
//!
//! - `models/{model}:generateContent` for one-shot generation
//! - `models/{model}:streamGenerateContent?alt=sse` for streaming
//! - `models/{model}:countTokens` for authoritative token counts
//!
//! A candidate stopped for safety or recitation, or a prompt rejected through
//! `promptFeedback.blockReason`, is reported as an upstream failure rather than
//! as an empty answer.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::sse_parser::decode_sse_stream;
use super::{ChatMessage, Fragment, FragmentStream, GenerationClient, GenerationConfig};
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::MessageRole;

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";
const CLIENT_NAME: &str = "gemini";

/// Finish reasons that mean the output was withheld
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "BLOCKED",
];

/// Connection settings for [`GeminiClient`]
#[derive(Clone)]
pub struct GeminiConfig {
    /// API key sent in the `x-goog-api-key` header
    pub api_key: String,
    /// Model identifier
    pub model: String,
    /// API root, overridable for gateways
    pub base_url: String,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
}

impl GeminiConfig {
    /// Settings for the public endpoint and default model
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_owned(),
            base_url: API_BASE_URL.to_owned(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Use a different model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Debug for GeminiConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ============================================================================
// Client
// ============================================================================

/// Gemini-backed [`GenerationClient`]
pub struct GeminiClient {
    config: GeminiConfig,
    http: Client,
}

impl GeminiClient {
    /// Build a client from explicit settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the API key is blank or the HTTP client cannot
    /// be constructed.
    pub fn new(config: GeminiConfig) -> AppResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AppError::config("Gemini API key is empty"));
        }
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AppError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{method}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn to_contents(prompt: &[ChatMessage]) -> Vec<Content> {
        prompt
            .iter()
            .map(|message| Content {
                role: Some(
                    match message.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "model",
                    }
                    .to_owned(),
                ),
                parts: vec![Part {
                    text: Some(message.content.clone()),
                }],
            })
            .collect()
    }

    fn build_request(prompt: &[ChatMessage], config: &GenerationConfig) -> GenerateContentRequest {
        let wire = WireGenerationConfig {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            top_k: config.top_k,
            top_p: config.top_p,
        };
        GenerateContentRequest {
            contents: Self::to_contents(prompt),
            generation_config: (wire != WireGenerationConfig::default()).then_some(wire),
        }
    }

    async fn post_json<B: Serialize + Sync>(
        &self,
        method: &str,
        body: &B,
        query: &[(&str, &str)],
    ) -> AppResult<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint(method))
            .header(API_KEY_HEADER, &self.config.api_key)
            .query(query)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                AppError::upstream_unavailable(format!("Gemini request failed: {e}"))
                    .with_source(e)
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_owned());
        error!(%status, method, "Gemini API error");
        Err(map_api_error(status, &body))
    }
}

/// Translate a non-success HTTP status into the error taxonomy
fn map_api_error(status: StatusCode, body: &str) -> AppError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map_or_else(|_| body.to_owned(), |envelope| envelope.error.message);

    match status {
        StatusCode::TOO_MANY_REQUESTS => AppError::new(
            ErrorCode::ExternalRateLimited,
            format!("Gemini quota exceeded: {message}"),
        ),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            AppError::upstream_unavailable(format!("Gemini unavailable ({status}): {message}"))
        }
        _ => AppError::upstream(format!("Gemini API error ({status}): {message}")),
    }
}

/// Reject prompt-level blocks and withheld candidates, otherwise return the text
fn extract_text(response: &GenerateContentResponse) -> AppResult<Fragment> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(AppError::upstream(format!("Prompt blocked by Gemini: {reason}"))
            .with_details(serde_json::json!({ "block_reason": reason })));
    }

    let Some(candidate) = response.candidates.first() else {
        return Ok(Fragment::default());
    };

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if BLOCKED_FINISH_REASONS.contains(&reason) {
            return Err(AppError::upstream(format!("Response withheld by Gemini: {reason}"))
                .with_details(serde_json::json!({ "finish_reason": reason })));
        }
    }

    let text = candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default();

    Ok(Fragment {
        text,
        finish_reason: candidate.finish_reason.clone(),
    })
}

fn decode_stream_payload(payload: &str) -> Option<AppResult<Fragment>> {
    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(response) => Some(extract_text(&response)),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable Gemini stream event");
            None
        }
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    fn name(&self) -> &'static str {
        CLIENT_NAME
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(
        skip(self, prompt, config),
        fields(model = %self.config.model, messages = prompt.len())
    )]
    async fn generate(
        &self,
        prompt: &[ChatMessage],
        config: &GenerationConfig,
    ) -> AppResult<String> {
        let request = Self::build_request(prompt, config);
        debug!("Sending generateContent request");

        let response = self.post_json("generateContent", &request, &[]).await?;
        let body = response
            .text()
            .await
            .map_err(|e| {
                AppError::upstream_unavailable(format!("Failed to read Gemini response: {e}"))
            })?;

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, "Failed to parse Gemini response");
            AppError::upstream(format!("Failed to parse Gemini response: {e}"))
        })?;

        Ok(extract_text(&parsed)?.text)
    }

    #[instrument(
        skip(self, prompt, config),
        fields(model = %self.config.model, messages = prompt.len())
    )]
    async fn generate_stream(
        &self,
        prompt: &[ChatMessage],
        config: &GenerationConfig,
    ) -> AppResult<FragmentStream> {
        let request = Self::build_request(prompt, config);
        debug!("Opening streamGenerateContent request");

        let response = self
            .post_json("streamGenerateContent", &request, &[("alt", "sse")])
            .await?;

        Ok(decode_sse_stream(
            response.bytes_stream(),
            decode_stream_payload,
            CLIENT_NAME,
        ))
    }

    #[instrument(skip(self, content), fields(model = %self.config.model, chars = content.len()))]
    async fn count_tokens(&self, content: &str) -> AppResult<u64> {
        let request = CountTokensRequest {
            contents: Self::to_contents(&[ChatMessage::user(content)]),
        };
        let response = self.post_json("countTokens", &request, &[]).await?;
        let counted: CountTokensResponse = response
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("Failed to parse countTokens response: {e}")))?;
        Ok(counted.total_tokens)
    }
}

impl Debug for GeminiClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
