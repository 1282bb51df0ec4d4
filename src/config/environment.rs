// ABOUTME: Environment-based server configuration with typed sections and defaults
// ABOUTME: Covers HTTP, database, generation client, admission limits, and orchestration tunables
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Environment-only configuration.
//!
//! Every setting has a default; a present but unparsable variable is an error
//! naming the variable.

use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::constants::{orchestration, rate_limits};
use crate::llm::GeminiConfig;
use crate::rate_limiting::PressureThresholds;
use crate::services::OrchestratorSettings;

/// Default HTTP listen port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
/// Default database location
pub const DEFAULT_DATABASE_URL: &str = "sqlite:./data/parley.db";

/// Storage settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,
}

/// Generation client settings
#[derive(Clone)]
pub struct LlmConfig {
    /// Gemini API key (`GEMINI_API_KEY`)
    pub api_key: Option<String>,
    /// Model override (`PARLEY_LLM_MODEL`)
    pub model: Option<String>,
    /// Idle timeout between streamed fragments
    pub stream_idle_timeout_secs: u64,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .finish()
    }
}

impl LlmConfig {
    /// Gemini client settings
    ///
    /// # Errors
    ///
    /// Fails when `GEMINI_API_KEY` is not set.
    pub fn gemini(&self) -> Result<GeminiConfig> {
        let api_key = self
            .api_key
            .clone()
            .context("GEMINI_API_KEY environment variable not set")?;
        let config = GeminiConfig::new(api_key);
        Ok(match &self.model {
            Some(model) => config.with_model(model.clone()),
            None => config,
        })
    }
}

/// Admission control settings
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// When false every request is admitted
    pub enabled: bool,
    /// Base request ceiling per window
    pub requests_per_window: u32,
    /// Request window length in seconds
    pub window_seconds: u64,
    /// Token budget per budget window
    pub token_budget: u64,
    /// Token budget window length in seconds
    pub token_window_seconds: u64,
    /// Pressure sampling interval in seconds
    pub pressure_interval_seconds: u64,
    /// Used-memory percentage for high pressure
    pub high_pressure_percent: f64,
    /// Used-memory percentage for critical pressure
    pub critical_pressure_percent: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: rate_limits::DEFAULT_REQUESTS_PER_WINDOW,
            window_seconds: rate_limits::DEFAULT_REQUEST_WINDOW_SECS,
            token_budget: rate_limits::DEFAULT_TOKEN_BUDGET,
            token_window_seconds: rate_limits::DEFAULT_TOKEN_WINDOW_SECS,
            pressure_interval_seconds: rate_limits::DEFAULT_PRESSURE_INTERVAL_SECS,
            high_pressure_percent: rate_limits::DEFAULT_HIGH_PRESSURE_PERCENT,
            critical_pressure_percent: rate_limits::DEFAULT_CRITICAL_PRESSURE_PERCENT,
        }
    }
}

impl RateLimitConfig {
    /// Request window length
    #[must_use]
    pub const fn request_window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Token budget window length
    #[must_use]
    pub const fn token_window(&self) -> Duration {
        Duration::from_secs(self.token_window_seconds)
    }

    /// Pressure sampling interval
    #[must_use]
    pub const fn pressure_interval(&self) -> Duration {
        Duration::from_secs(self.pressure_interval_seconds)
    }

    /// Memory thresholds for the pressure monitor
    #[must_use]
    pub const fn thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            high_percent: self.high_pressure_percent,
            critical_percent: self.critical_pressure_percent,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.requests_per_window == 0 {
            bail!("RATE_LIMIT_REQUESTS must be at least 1");
        }
        if self.window_seconds == 0 || self.token_window_seconds == 0 {
            bail!("Rate limit windows must be at least one second");
        }
        if self.pressure_interval_seconds == 0 {
            bail!("PRESSURE_SAMPLE_INTERVAL_SECS must be at least 1");
        }
        if self.high_pressure_percent >= self.critical_pressure_percent {
            bail!("PRESSURE_HIGH_PERCENT must be below PRESSURE_CRITICAL_PERCENT");
        }
        Ok(())
    }
}

/// Orchestrator tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Prior messages sent upstream per turn
    pub history_limit: i64,
    /// Assistant-write retry backoff in milliseconds
    pub assistant_retry_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_limit: orchestration::DEFAULT_HISTORY_LIMIT,
            assistant_retry_backoff_ms: orchestration::ASSISTANT_RETRY_BACKOFF_MS,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Storage
    pub database: DatabaseConfig,
    /// Generation client
    pub llm: LlmConfig,
    /// Admission control
    pub rate_limit: RateLimitConfig,
    /// Orchestrator tunables
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Fails when a variable is present but cannot be parsed, or the limits are
    /// inconsistent.
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment variables");

        let config = Self {
            http_port: env_var_or("HTTP_PORT", &DEFAULT_HTTP_PORT.to_string())
                .parse()
                .context("Invalid HTTP_PORT value")?,
            database: DatabaseConfig {
                url: env_var_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            },
            llm: LlmConfig {
                api_key: env::var("GEMINI_API_KEY").ok().filter(|key| !key.trim().is_empty()),
                model: env::var("PARLEY_LLM_MODEL").ok().filter(|model| !model.trim().is_empty()),
                stream_idle_timeout_secs: env_var_or(
                    "LLM_STREAM_IDLE_TIMEOUT_SECS",
                    &orchestration::STREAM_IDLE_TIMEOUT_SECS.to_string(),
                )
                .parse()
                .context("Invalid LLM_STREAM_IDLE_TIMEOUT_SECS value")?,
            },
            rate_limit: RateLimitConfig {
                enabled: env_var_or("RATE_LIMIT_ENABLED", "true")
                    .parse()
                    .context("Invalid RATE_LIMIT_ENABLED value")?,
                requests_per_window: env_var_or(
                    "RATE_LIMIT_REQUESTS",
                    &rate_limits::DEFAULT_REQUESTS_PER_WINDOW.to_string(),
                )
                .parse()
                .context("Invalid RATE_LIMIT_REQUESTS value")?,
                window_seconds: env_var_or(
                    "RATE_LIMIT_WINDOW_SECS",
                    &rate_limits::DEFAULT_REQUEST_WINDOW_SECS.to_string(),
                )
                .parse()
                .context("Invalid RATE_LIMIT_WINDOW_SECS value")?,
                token_budget: env_var_or(
                    "TOKEN_BUDGET_CAPACITY",
                    &rate_limits::DEFAULT_TOKEN_BUDGET.to_string(),
                )
                .parse()
                .context("Invalid TOKEN_BUDGET_CAPACITY value")?,
                token_window_seconds: env_var_or(
                    "TOKEN_BUDGET_WINDOW_SECS",
                    &rate_limits::DEFAULT_TOKEN_WINDOW_SECS.to_string(),
                )
                .parse()
                .context("Invalid TOKEN_BUDGET_WINDOW_SECS value")?,
                pressure_interval_seconds: env_var_or(
                    "PRESSURE_SAMPLE_INTERVAL_SECS",
                    &rate_limits::DEFAULT_PRESSURE_INTERVAL_SECS.to_string(),
                )
                .parse()
                .context("Invalid PRESSURE_SAMPLE_INTERVAL_SECS value")?,
                high_pressure_percent: env_var_or(
                    "PRESSURE_HIGH_PERCENT",
                    &rate_limits::DEFAULT_HIGH_PRESSURE_PERCENT.to_string(),
                )
                .parse()
                .context("Invalid PRESSURE_HIGH_PERCENT value")?,
                critical_pressure_percent: env_var_or(
                    "PRESSURE_CRITICAL_PERCENT",
                    &rate_limits::DEFAULT_CRITICAL_PRESSURE_PERCENT.to_string(),
                )
                .parse()
                .context("Invalid PRESSURE_CRITICAL_PERCENT value")?,
            },
            orchestrator: OrchestratorConfig {
                history_limit: env_var_or(
                    "CHAT_HISTORY_LIMIT",
                    &orchestration::DEFAULT_HISTORY_LIMIT.to_string(),
                )
                .parse()
                .context("Invalid CHAT_HISTORY_LIMIT value")?,
                assistant_retry_backoff_ms: env_var_or(
                    "ASSISTANT_RETRY_BACKOFF_MS",
                    &orchestration::ASSISTANT_RETRY_BACKOFF_MS.to_string(),
                )
                .parse()
                .context("Invalid ASSISTANT_RETRY_BACKOFF_MS value")?,
            },
        };

        config.rate_limit.validate()?;
        if config.llm.stream_idle_timeout_secs == 0 {
            bail!("LLM_STREAM_IDLE_TIMEOUT_SECS must be at least 1");
        }
        Ok(config)
    }

    /// Settings handed to the streaming orchestrator
    #[must_use]
    pub const fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            history_limit: self.orchestrator.history_limit,
            stream_idle_timeout: Duration::from_secs(self.llm.stream_idle_timeout_secs),
            assistant_retry_backoff: Duration::from_millis(
                self.orchestrator.assistant_retry_backoff_ms,
            ),
        }
    }

    /// Get a summary of the configuration for logging (without secrets)
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Parley Server Configuration:\n\
             - HTTP Port: {}\n\
             - Database: {}\n\
             - Gemini API Key: {}\n\
             - Model: {}\n\
             - Rate Limiting: {}\n\
             - Request Window: {} per {}s\n\
             - Token Budget: {} per {}s\n\
             - History Limit: {}",
            self.http_port,
            if self.database.url.contains(":memory:") {
                "SQLite (in-memory)"
            } else {
                "SQLite"
            },
            if self.llm.api_key.is_some() {
                "Configured"
            } else {
                "Missing"
            },
            self.llm
                .model
                .as_deref()
                .unwrap_or(crate::llm::DEFAULT_MODEL),
            if self.rate_limit.enabled {
                "Enabled"
            } else {
                "Disabled"
            },
            self.rate_limit.requests_per_window,
            self.rate_limit.window_seconds,
            self.rate_limit.token_budget,
            self.rate_limit.token_window_seconds,
            self.orchestrator.history_limit,
        )
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
