// ABOUTME: Route module organization for the Parley HTTP endpoints
// ABOUTME: Groups chat turn, conversation, and health routes by domain
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! HTTP routes
//!
//! Handlers stay thin: they resolve the caller's identity, apply admission
//! control where a request costs model tokens, and delegate to the service
//! layer.

/// Chat turns and conversation management
pub mod chat;
/// Liveness and degradation status
pub mod health;

pub use chat::ChatRoutes;
pub use health::HealthRoutes;
