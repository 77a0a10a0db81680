//! Error types for the sync core.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EntityKind;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the offending field (snake_case, as serialized).
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every validation failure found in one payload, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.field.as_str())
    }

    /// Whether any error was reported for `field`.
    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", err.field, err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Errors that can occur in the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Payload failed field-level checks. Never reaches the network.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// Missing or rejected account identity.
    #[error("authentication required: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Live call exceeded its deadline.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Non-success response carrying an error envelope.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Record not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Changefeed channel failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// Persisted store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration rejected by `SyncConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Auth,
    Network,
    NotFound,
    Channel,
    Storage,
}

impl SyncError {
    /// Classify this error.
    ///
    /// Only `Validation` and `Auth` are meant to reach the user; everything
    /// classed `Network` is absorbed by the fallback chain on reads.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::Auth(_) => ErrorClass::Auth,
            SyncError::Http(_)
            | SyncError::Json(_)
            | SyncError::Timeout(_)
            | SyncError::Api { .. }
            | SyncError::InvalidResponse(_) => ErrorClass::Network,
            SyncError::NotFound { .. } => ErrorClass::NotFound,
            SyncError::Channel(_) => ErrorClass::Channel,
            SyncError::Storage(_) | SyncError::InvalidConfig(_) | SyncError::Io(_) => {
                ErrorClass::Storage
            }
        }
    }

    /// Field errors, if this is a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            SyncError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for SyncError {
    fn from(errors: ValidationErrors) -> Self {
        SyncError::Validation(errors)
    }
}
