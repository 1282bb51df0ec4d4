// ABOUTME: Main library entry point for the Parley turn orchestration server
// ABOUTME: Streams model output to callers while persisting conversations and metering tokens
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![deny(unsafe_code)]

//! # Parley Server
//!
//! A backend layer between API callers and a remote generative-language model.
//! Each conversational turn is executed end to end: the conversation is
//! resolved or created, the model is called in streaming mode, chunks are
//! relayed to the caller in order, the exchange is persisted, and its token
//! cost is charged to both the conversation and the caller's budget.
//!
//! ## Architecture
//!
//! - **Database**: conversation and message persistence behind a store trait
//! - **LLM**: generation client trait with a Gemini implementation
//! - **Services**: streaming orchestrator, token accountant, write locks
//! - **Rate limiting**: request windows, token budgets, adaptive ceilings
//! - **Routes**: axum handlers with SSE turn streaming
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use parley_server::config::environment::ServerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("Parley configured with port: HTTP={}", config.http_port);
//!     Ok(())
//! }
//! ```

/// Environment-driven configuration
pub mod config;

/// Application constants
pub mod constants;

/// Conversation store trait and `SQLite` implementation
pub mod database;

/// Unified error handling
pub mod errors;

/// Generation client abstraction and Gemini client
pub mod llm;

/// Structured logging setup
pub mod logging;

/// Conversation and message models
pub mod models;

/// Admission control and resource pressure monitoring
pub mod rate_limiting;

/// HTTP route handlers
pub mod routes;

/// Shared resources and the HTTP server
pub mod server;

/// Turn orchestration and token accounting
pub mod services;
