// ABOUTME: Configuration management module for server settings
// ABOUTME: Environment-only configuration loaded once at startup
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Configuration module for the Parley server
//!
//! - **Environment**: typed server configuration read from environment variables

/// Environment and server configuration
pub mod environment;

pub use environment::{
    DatabaseConfig, LlmConfig, OrchestratorConfig, RateLimitConfig, ServerConfig,
};
