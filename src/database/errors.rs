// ABOUTME: Structured error types for store operations re-exported from parley-core
// ABOUTME: Provides DatabaseError with context and its conversion into AppError
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

pub use parley_core::errors::database::*;
