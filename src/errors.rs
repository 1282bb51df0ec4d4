// ABOUTME: Re-exports the error taxonomy from parley-core
// ABOUTME: Keeps AppError and ErrorCode the same type across workspace crates
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

pub use parley_core::errors::*;
