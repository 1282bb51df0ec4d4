// ABOUTME: Generation client abstraction for the remote language model
// ABOUTME: Defines prompt messages, generation options, fragments, and the client trait
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Generation Client
//!
//! The orchestrator talks to the remote model only through [`GenerationClient`].
//! A client instance is constructed explicitly and handed to whoever needs it;
//! there is no process-wide singleton.
//!
//! - [`ChatMessage`]: one role-tagged entry of the prompt sent upstream
//! - [`GenerationConfig`]: caller-supplied sampling options, validated before use
//! - [`Fragment`] / [`FragmentStream`]: incremental output of a streaming call
//!
//! None of the operations retry implicitly.
//!
//! ```rust,no_run
//! use parley_server::llm::{ChatMessage, GenerationClient, GenerationConfig};
//!
//! async fn example(client: &dyn GenerationClient) {
//!     let prompt = vec![ChatMessage::user("Explain recursion")];
//!     let text = client.generate(&prompt, &GenerationConfig::default()).await;
//! }
//! ```

mod gemini;
pub mod sse_parser;

pub use gemini::{GeminiClient, GeminiConfig, DEFAULT_MODEL};

use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::constants::generation;
use crate::errors::{AppError, AppResult};
use crate::models::MessageRole;

/// A single prompt entry sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who authored the entry
    pub role: MessageRole,
    /// Entry text
    pub content: String,
}

impl ChatMessage {
    /// Create a user entry
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant entry
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Caller-supplied generation options.
///
/// Integer options are kept signed so that negative input reaches
/// [`GenerationConfig::validate`] and is reported as invalid input instead of
/// failing deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature, 0.0 to 2.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Upper bound on generated tokens, at least 1
    #[serde(
        default,
        alias = "max_output_tokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_output_tokens: Option<i64>,
    /// Top-k sampling, at least 1
    #[serde(default, alias = "top_k", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    /// Nucleus sampling probability, 0.0 to 1.0
    #[serde(default, alias = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl GenerationConfig {
    /// Check every present option against its accepted range
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending option.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(temperature) = self.temperature {
            let range =
                f64::from(generation::MIN_TEMPERATURE)..=f64::from(generation::MAX_TEMPERATURE);
            if !range.contains(&temperature) {
                return Err(AppError::out_of_range(
                    "temperature",
                    format!("temperature must be within [{}, {}]", range.start(), range.end()),
                ));
            }
        }
        if let Some(max_output_tokens) = self.max_output_tokens {
            if max_output_tokens < 1 {
                return Err(AppError::out_of_range(
                    "maxOutputTokens",
                    "maxOutputTokens must be at least 1",
                ));
            }
        }
        if let Some(top_k) = self.top_k {
            if top_k < 1 {
                return Err(AppError::out_of_range("topK", "topK must be at least 1"));
            }
        }
        if let Some(top_p) = self.top_p {
            let range = f64::from(generation::MIN_TOP_P)..=f64::from(generation::MAX_TOP_P);
            if !range.contains(&top_p) {
                return Err(AppError::out_of_range(
                    "topP",
                    format!("topP must be within [{}, {}]", range.start(), range.end()),
                ));
            }
        }
        Ok(())
    }
}

/// One increment of streamed output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    /// Text produced since the previous fragment
    pub text: String,
    /// Set on the last fragment when the model reports why it stopped
    pub finish_reason: Option<String>,
}

impl Fragment {
    /// Fragment carrying only text
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: None,
        }
    }
}

/// Lazy, finite, non-restartable sequence of fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, AppError>> + Send>>;

/// Remote generation surface
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Short client name for logs
    fn name(&self) -> &'static str;

    /// Model identifier requests are sent to
    fn model(&self) -> &str;

    /// Generate a complete response in one call
    async fn generate(&self, prompt: &[ChatMessage], config: &GenerationConfig)
        -> AppResult<String>;

    /// Open a streaming generation call
    async fn generate_stream(
        &self,
        prompt: &[ChatMessage],
        config: &GenerationConfig,
    ) -> AppResult<FragmentStream>;

    /// Authoritative token count for `content`
    async fn count_tokens(&self, content: &str) -> AppResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn test_empty_config_is_valid() {
        assert!(GenerationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_bounds_inclusive() {
        let config = GenerationConfig {
            temperature: Some(2.0),
            max_output_tokens: Some(1),
            top_k: Some(1),
            top_p: Some(0.0),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_out_of_range() {
        let cases = [
            GenerationConfig {
                temperature: Some(2.5),
                ..GenerationConfig::default()
            },
            GenerationConfig {
                max_output_tokens: Some(0),
                ..GenerationConfig::default()
            },
            GenerationConfig {
                top_k: Some(-3),
                ..GenerationConfig::default()
            },
            GenerationConfig {
                top_p: Some(1.01),
                ..GenerationConfig::default()
            },
        ];
        for config in cases {
            let error = config.validate().unwrap_err();
            assert_eq!(error.code, ErrorCode::ValueOutOfRange);
        }
    }

    #[test]
    fn test_nan_temperature_rejected() {
        let config = GenerationConfig {
            temperature: Some(f64::NAN),
            ..GenerationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_accepts_camel_and_snake_case() {
        let camel: GenerationConfig =
            serde_json::from_str(r#"{"maxOutputTokens": 64, "topK": 4}"#).unwrap();
        let snake: GenerationConfig =
            serde_json::from_str(r#"{"max_output_tokens": 64, "top_k": 4}"#).unwrap();
        assert_eq!(camel, snake);
    }
}
