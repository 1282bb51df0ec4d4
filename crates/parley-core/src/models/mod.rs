// ABOUTME: Core data models for the Parley turn orchestration server
// ABOUTME: Re-exports conversation, message, and token usage records
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Data Models
//!
//! - `Conversation`: multi-turn conversation owned by exactly one caller
//! - `Message`: one append-only entry of a conversation
//! - `ConversationTokenUsage`: running token total and estimated cost

mod conversation;

pub use conversation::{
    derive_title, normalize_tags, Attachment, Conversation, ConversationSummary,
    ConversationTokenUsage, Message, MessageRole, MessageType,
};
