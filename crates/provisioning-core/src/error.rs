// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for provisioning-core.
//!
//! Only [`EngineError::StorageUnavailable`] is fatal to an inbound callback;
//! every other variant is either a caller bug surfaced to the dispatcher or
//! is recovered locally by the engine.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the registry, the parser, the dispatcher and the stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A handler with this request id is already registered.
    #[error("Request '{request_id}' is already registered")]
    DuplicateRequest {
        /// The colliding request id.
        request_id: String,
    },

    /// No outstanding handler for this request id (unknown, resolved, or claimed).
    #[error("Request '{request_id}' not found or already resolved")]
    NotFound {
        /// The request id that was looked up.
        request_id: String,
    },

    /// The callback payload does not match the schema for its resource kind.
    #[error("Malformed callback payload: {reason}")]
    MalformedPayload {
        /// What was wrong with the payload.
        reason: String,
    },

    /// The reported result cannot be reconciled with the requested action.
    #[error("Cannot apply {action} result '{reported}' to resource '{resource}'")]
    IncompatibleTransition {
        /// The resource key.
        resource: String,
        /// The action that was dispatched.
        action: String,
        /// The status reported by the execution layer.
        reported: String,
    },

    /// Another action is in progress for the resource.
    #[error("Resource '{resource}' is busy with status '{status}'")]
    ResourceBusy {
        /// The resource key.
        resource: String,
        /// The status that blocked the dispatch.
        status: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The execution layer refused or could not receive the action.
    #[error("Dispatch of request '{request_id}' failed: {reason}")]
    DispatchFailed {
        /// The request id of the failed dispatch.
        request_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Registry or status store I/O failed.
    #[error("Storage unavailable during '{operation}': {details}")]
    StorageUnavailable {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::IncompatibleTransition { .. } => "INCOMPATIBLE_TRANSITION",
            Self::ResourceBusy { .. } => "RESOURCE_BUSY",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
        }
    }

    /// Whether the external caller should retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    pub(crate) fn not_found(request_id: impl Into<String>) -> Self {
        Self::NotFound {
            request_id: request_id.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(operation: &str, details: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::storage("query", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::storage("json", err)
    }
}
