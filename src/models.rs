// ABOUTME: Re-exports conversation and message models from parley-core
// ABOUTME: Ensures the store, orchestrator, and routes share one set of record types
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

pub use parley_core::models::*;
