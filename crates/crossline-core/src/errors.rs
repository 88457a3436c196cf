//! Error taxonomy shared by every Crossline crate.
//!
//! [`CrosslineError`] splits failures into the kinds callers branch on:
//!
//! - [`CrosslineError::Validation`]: bad or missing input, rejected before any
//!   state changes
//! - [`CrosslineError::NotFound`]: a plan, cross, task or route is absent
//! - [`CrosslineError::Business`]: a rule violation with a machine code
//!   (forbidden mode transition, inconsistent lock stage, cancelling a
//!   terminal task)
//! - [`CrosslineError::Timeout`] / [`CrosslineError::ConnectionClosed`]:
//!   transport failures scoped to a single pending call
//! - [`CrosslineError::PartialFailure`]: batch operations listing the
//!   identifiers that failed
//!
//! Errors travel over the wire as an [`ErrorBody`] inside a RESPONSE.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ── Error code constants ────────────────────────────────────────────

/// Input failed validation.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Referenced entity does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Request timed out waiting for a response.
pub const TIMEOUT: &str = "TIMEOUT";
/// Connection closed before the call completed.
pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
/// Some items of a batch failed.
pub const PARTIAL_FAILURE: &str = "PARTIAL_FAILURE";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Mode transition rejected by the transition rule table.
pub const SWITCH_FORBIDDEN: &str = "SWITCH_FORBIDDEN";
/// Lock type and lock stage number disagree.
pub const LOCK_STAGE_MISMATCH: &str = "LOCK_STAGE_MISMATCH";
/// Cross is in a special mode and cannot hold a flow lock.
pub const LOCK_MODE_CONFLICT: &str = "LOCK_MODE_CONFLICT";
/// Task is already in a terminal state.
pub const TASK_NOT_CANCELLABLE: &str = "TASK_NOT_CANCELLABLE";
/// Token rejected by the auth collaborator.
pub const AUTH_REJECTED: &str = "AUTH_REJECTED";
/// No handler registered for the operation/object pair.
pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
/// Peer did not log in before issuing a request that needs an identity.
pub const NOT_LOGGED_IN: &str = "NOT_LOGGED_IN";

/// Classification of a [`CrosslineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input.
    Validation,
    /// Missing entity.
    NotFound,
    /// Rule violation.
    Business,
    /// Call deadline elapsed.
    Timeout,
    /// Connection went away.
    ConnectionClosed,
    /// Batch with failed items.
    PartialFailure,
    /// Anything else.
    Internal,
}

/// One failed identifier inside a [`CrosslineError::PartialFailure`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Identifier that failed (cross id, object index, ...).
    pub id: String,
    /// Why it failed.
    pub reason: String,
}

/// Top-level error type.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CrosslineError {
    /// Input failed validation; no state was changed.
    #[error("validation failed: {message}")]
    Validation {
        /// What is wrong with the input.
        message: String,
    },

    /// Referenced entity was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (`plan`, `task`, ...).
        entity: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// Business rule violation.
    #[error("[{code}] {message}")]
    Business {
        /// Machine-readable rule code (e.g. `SWITCH_FORBIDDEN`).
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Request timed out waiting for its response.
    #[error("request {sequence} timed out after {timeout_ms}ms")]
    Timeout {
        /// Sequence of the request.
        sequence: u64,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// Connection closed while the call was outstanding.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why the connection closed.
        reason: String,
    },

    /// Some items of a batch operation failed.
    #[error("{operation} failed for {} of {total} items", failed.len())]
    PartialFailure {
        /// Batch operation name.
        operation: String,
        /// Number of items attempted.
        total: usize,
        /// Items that failed.
        failed: Vec<FailedItem>,
    },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl CrosslineError {
    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a not-found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Build a business-rule error.
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Business {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a connection-closed error.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Business { .. } => ErrorKind::Business,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { .. } => VALIDATION_ERROR,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Business { code, .. } => code,
            Self::Timeout { .. } => TIMEOUT,
            Self::ConnectionClosed { .. } => CONNECTION_CLOSED,
            Self::PartialFailure { .. } => PARTIAL_FAILURE,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        let details = match self {
            Self::PartialFailure { failed, total, .. } => Some(serde_json::json!({
                "total": total,
                "failed": failed,
            })),
            Self::NotFound { entity, id } => Some(serde_json::json!({
                "entity": entity,
                "id": id,
            })),
            _ => None,
        };
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details,
        }
    }

    /// Rebuild an error received from a peer.
    ///
    /// Unknown codes are treated as business errors so the peer's code is
    /// preserved.
    pub fn from_error_body(body: &ErrorBody) -> Self {
        match body.code.as_str() {
            VALIDATION_ERROR => Self::validation(body.message.clone()),
            NOT_FOUND => Self::not_found(
                detail_str(body.details.as_ref(), "entity").unwrap_or("entity"),
                detail_str(body.details.as_ref(), "id").unwrap_or_default(),
            ),
            CONNECTION_CLOSED => Self::connection_closed(body.message.clone()),
            INTERNAL_ERROR => Self::internal(body.message.clone()),
            code => Self::business(code, body.message.clone()),
        }
    }
}

fn detail_str<'a>(details: Option<&'a Value>, key: &str) -> Option<&'a str> {
    details.and_then(|d| d.get(key)).and_then(Value::as_str)
}

/// Structured error carried inside a RESPONSE.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result alias used across Crossline crates.
pub type Result<T> = std::result::Result<T, CrosslineError>;
