// ABOUTME: Structured error types for conversation store operations
// ABOUTME: Wraps sqlx failures with context and maps them onto AppError
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use super::{AppError, ErrorCode};

/// Errors raised by the conversation store
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Connection or pool setup failed
    #[error("Database connection failed: {context}")]
    ConnectionError {
        /// What was being attempted
        context: String,
    },

    /// A query failed to execute
    #[error("Database query failed: {context}")]
    QueryError {
        /// What was being attempted
        context: String,
    },

    /// A stored value could not be decoded
    #[error("Invalid stored data in {field}: {reason}")]
    InvalidData {
        /// Column or field name
        field: &'static str,
        /// Why decoding failed
        reason: String,
    },

    /// Schema bootstrap failed
    #[error("Schema migration failed: {0}")]
    MigrationError(String),

    /// Underlying driver error
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Build a query error from any displayable cause
    #[must_use]
    pub fn query(context: impl std::fmt::Display) -> Self {
        Self::QueryError {
            context: context.to_string(),
        }
    }
}

impl From<DatabaseError> for AppError {
    fn from(error: DatabaseError) -> Self {
        let message = error.to_string();
        Self::new(ErrorCode::DatabaseError, message).with_source(error)
    }
}
