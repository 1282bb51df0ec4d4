// ABOUTME: Core types and constants for the Parley turn orchestration server
// ABOUTME: Foundation crate with error handling, conversation models, and constants
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![deny(unsafe_code)]

//! # Parley Core
//!
//! Foundation crate providing shared types and constants for the Parley
//! streaming turn orchestration server. This crate is designed to change
//! infrequently, enabling incremental compilation benefits in the workspace.
//!
//! ## Modules
//!
//! - **errors**: Unified error handling with `AppError`, `ErrorCode`, and `DatabaseError`
//! - **constants**: Limits, cost constants, and rate limit defaults
//! - **models**: Conversation, message, and token usage records

/// Unified error handling system with standard error codes and HTTP responses
pub mod errors;

/// Application constants organized by domain
pub mod constants;

/// Core data models (conversations, messages, token usage)
pub mod models;
