// ABOUTME: Domain service layer for turn orchestration and token accounting
// ABOUTME: Protocol-agnostic logic shared by the HTTP routes and tests
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! Domain service layer
//!
//! Business rules for a conversational turn live here rather than in route
//! handlers, so the same behavior applies regardless of the entry point.

/// Streaming turn execution
pub mod chat_orchestration;

/// Keyed single-writer locks per conversation
pub mod conversation_locks;

/// Token counting and running totals
pub mod token_accountant;

pub use chat_orchestration::{
    ChunkEvent, OrchestratorSettings, SinkClosed, StreamingOrchestrator, TurnError, TurnRequest,
    TurnResult, TurnSink, TurnStarted, TurnStatus, TurnUsage, validate_prompt,
};
pub use conversation_locks::{ConversationLocks, ConversationWriteGuard};
pub use token_accountant::{TokenAccountant, TokenCount};
