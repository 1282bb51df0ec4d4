// ABOUTME: Constants module with domain-separated organization
// ABOUTME: Pure data constants for turns, tokens, tags, and admission defaults
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Constants module
//!
//! Constants are grouped into logical domains rather than being in a single
//! large file.

/// Service identity used in logs and health responses
pub mod service_names {
    /// Server binary / service name
    pub const PARLEY_SERVER: &str = "parley-server";
}

/// Prompt, title, and tag limits
pub mod limits {
    /// Maximum prompt length in characters
    pub const MAX_PROMPT_CHARS: usize = 10_000;
    /// Maximum auto-generated title length in characters
    pub const TITLE_MAX_CHARS: usize = 50;
    /// Title used when the prompt has no printable content
    pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";
    /// Maximum explicit title length accepted on update
    pub const MAX_TITLE_CHARS: usize = 200;
    /// Maximum number of tags per conversation
    pub const MAX_TAGS: usize = 10;
    /// Maximum characters per tag
    pub const MAX_TAG_CHARS: usize = 32;
    /// Owner identifiers longer than this are rejected
    pub const MAX_IDENTITY_CHARS: usize = 128;
    /// Conversation owner for callers without an identity; never a valid owner id
    pub const ANONYMOUS_OWNER_ID: &str = "";
    /// Default page size when listing conversations
    pub const DEFAULT_LIST_LIMIT: i64 = 20;
    /// Largest page size accepted when listing conversations
    pub const MAX_LIST_LIMIT: i64 = 100;
}

/// Token accounting constants
pub mod tokens {
    /// Estimated cost in USD charged per token
    pub const COST_PER_TOKEN: f64 = 0.000_002;
    /// Characters per token used by the heuristic estimator
    pub const ESTIMATOR_CHARS_PER_TOKEN: usize = 5;
    /// Fixed overhead added by the heuristic estimator
    pub const ESTIMATOR_OVERHEAD: u64 = 10;
}

/// Generation option bounds
pub mod generation {
    /// Lowest accepted temperature
    pub const MIN_TEMPERATURE: f32 = 0.0;
    /// Highest accepted temperature
    pub const MAX_TEMPERATURE: f32 = 2.0;
    /// Lowest accepted nucleus sampling probability
    pub const MIN_TOP_P: f32 = 0.0;
    /// Highest accepted nucleus sampling probability
    pub const MAX_TOP_P: f32 = 1.0;
}

/// Orchestrator defaults
pub mod orchestration {
    /// Messages of prior history sent upstream with each turn
    pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
    /// Fixed backoff before the single assistant-write retry
    pub const ASSISTANT_RETRY_BACKOFF_MS: u64 = 250;
    /// Maximum wait for the next streamed fragment
    pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
}

/// Admission controller defaults
pub mod rate_limits {
    /// Requests admitted per window
    pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 100;
    /// Request window length (15 minutes)
    pub const DEFAULT_REQUEST_WINDOW_SECS: u64 = 15 * 60;
    /// Tokens charged per budget window
    pub const DEFAULT_TOKEN_BUDGET: u64 = 100_000;
    /// Token budget window length (1 hour)
    pub const DEFAULT_TOKEN_WINDOW_SECS: u64 = 60 * 60;
    /// Resource pressure sampling interval
    pub const DEFAULT_PRESSURE_INTERVAL_SECS: u64 = 60;
    /// Memory usage percentage treated as high pressure
    pub const DEFAULT_HIGH_PRESSURE_PERCENT: f64 = 80.0;
    /// Memory usage percentage treated as critical pressure
    pub const DEFAULT_CRITICAL_PRESSURE_PERCENT: f64 = 90.0;
    /// Ceiling multiplier under high pressure
    pub const HIGH_PRESSURE_FACTOR: f64 = 0.75;
    /// Ceiling multiplier under critical pressure
    pub const CRITICAL_PRESSURE_FACTOR: f64 = 0.5;
    /// Limiter map size that triggers a purge of idle entries
    pub const DEFAULT_CLEANUP_THRESHOLD: usize = 10_000;
    /// Key shared by every caller without an identity
    pub const ANONYMOUS_IDENTITY_KEY: &str = "anonymous";
}
