// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orchestra-core.
//!
//! Provides a unified error type that maps to wire-level status codes and to
//! the structured failure record carried in `taskInfo.failure`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while routing or processing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// No document (or live service) exists at the address.
    DocumentNotFound {
        /// The address that was not found.
        link: String,
    },

    /// A document already exists at the address (duplicate create).
    DocumentAlreadyExists {
        /// The address that already exists.
        link: String,
    },

    /// Optimistic versioning check failed.
    VersionConflict {
        /// The document address.
        link: String,
        /// The version the writer expected.
        expected: u64,
        /// The version found in the store.
        actual: u64,
    },

    /// A stage or substage transition was rejected.
    InvalidTransition {
        /// The task address.
        link: String,
        /// Why the transition was rejected.
        message: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The operation conflicts with the current state of the document.
    Conflict {
        /// The document address.
        link: String,
        /// The conflict description.
        message: String,
    },

    /// The address did not become available in time.
    ServiceUnavailable {
        /// The address that was waited on.
        link: String,
    },

    /// Delivery to another service or external URL failed.
    DeliveryFailed {
        /// Where the delivery was addressed.
        target: String,
        /// The reason for failure.
        reason: String,
    },

    /// The receiving service dropped the operation without answering.
    Cancelled {
        /// The address the operation was sent to.
        link: String,
    },

    /// Document store operation failed.
    StoreError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::DocumentAlreadyExists { .. } => "DOCUMENT_ALREADY_EXISTS",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Conflict { .. } => "CONFLICT",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::StoreError { .. } => "STORE_ERROR",
        }
    }

    /// HTTP-equivalent status code reported to the caller of an operation.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidTransition { .. } | Self::ValidationError { .. } => 400,
            Self::DocumentNotFound { .. } => 404,
            Self::DocumentAlreadyExists { .. }
            | Self::VersionConflict { .. }
            | Self::Conflict { .. } => 409,
            Self::DeliveryFailed { .. } => 502,
            Self::ServiceUnavailable { .. } => 503,
            Self::Cancelled { .. } | Self::StoreError { .. } => 500,
        }
    }

    /// Whether the error was caused by the receiver going away mid-operation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Convert this error into the structured failure record stored on tasks.
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            message: self.to_string(),
            status_code: self.status_code(),
            error_code: Some(self.error_code().to_string()),
            locale: None,
        }
    }

    /// Shorthand for a validation error on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocumentNotFound { link } => {
                write!(f, "Document '{}' not found", link)
            }
            Self::DocumentAlreadyExists { link } => {
                write!(f, "Document '{}' already exists", link)
            }
            Self::VersionConflict {
                link,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Version conflict on '{}': expected {}, found {}",
                    link, expected, actual
                )
            }
            Self::InvalidTransition { link, message } => {
                write!(f, "Invalid transition for '{}': {}", link, message)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Conflict { message, .. } => write!(f, "{}", message),
            Self::ServiceUnavailable { link } => {
                write!(f, "Service '{}' did not become available", link)
            }
            Self::DeliveryFailed { target, reason } => {
                write!(f, "Delivery to '{}' failed: {}", target, reason)
            }
            Self::Cancelled { link } => {
                write!(f, "Operation on '{}' was cancelled", link)
            }
            Self::StoreError { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::ValidationError {
            field: "body".to_string(),
            message: err.to_string(),
        }
    }
}

/// Structured failure record carried in `taskInfo.failure` and in failed
/// callback responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Human readable message.
    pub message: String,
    /// HTTP-equivalent status code.
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    /// Machine readable error code, when the failure came from a [`CoreError`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Locale the originating request asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

fn default_status_code() -> u16 {
    500
}

impl ErrorResponse {
    /// Failure built from a plain message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: default_status_code(),
            error_code: None,
            locale: None,
        }
    }

    /// Failure built from any error; [`CoreError`] keeps its code and status.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        match err.downcast_ref::<CoreError>() {
            Some(core) => core.to_error_response(),
            None => Self::from_message(err.to_string()),
        }
    }

    /// Attach the requested locale.
    pub fn with_locale(mut self, locale: Option<String>) -> Self {
        self.locale = locale;
        self
    }
}
