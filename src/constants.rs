// ABOUTME: Re-exports domain constants from parley-core
// ABOUTME: Limits, token costs, and admission defaults used across the server
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

pub use parley_core::constants::*;
