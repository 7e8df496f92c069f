// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hearth-core.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// A stored string did not name any variant of the expected enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: '{value}'")]
pub struct ParseEnumError {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
}

/// Errors raised by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The stored context moved on since the writer loaded it.
    ContextConflict {
        /// Subscription of the context.
        subscription_id: String,
        /// Version the writer derived its copy from.
        expected_version: i64,
    },

    /// A stored row could not be decoded into a domain value.
    DecodeError {
        /// The column or field being decoded.
        field: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Whether this is a lost optimistic-concurrency race on a context.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ContextConflict { .. })
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ContextConflict { .. } => "CONTEXT_CONFLICT",
            Self::DecodeError { .. } => "DECODE_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn decode(field: &str, details: impl fmt::Display) -> Self {
        Self::DecodeError {
            field: field.to_string(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextConflict {
                subscription_id,
                expected_version,
            } => write!(
                f,
                "Provisioning context of '{}' changed concurrently (expected version {})",
                subscription_id, expected_version
            ),
            Self::DecodeError { field, details } => {
                write!(f, "Failed to decode '{}': {}", field, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::decode("json", err)
    }
}

impl From<ParseEnumError> for CoreError {
    fn from(err: ParseEnumError) -> Self {
        CoreError::decode(err.kind, err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
