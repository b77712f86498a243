//! Error types for the orchestration core.
//!
//! Two distinct layers exist here:
//!
//! - [`Error`] is the programmer-facing error returned by fallible operations.
//! - [`ErrorCode`] is the numeric taxonomy carried on failed flows. It is
//!   persisted alongside the flow row and drives retry decisions: only
//!   `TRANSIENT` and `TIMEOUT` codes are eligible for automatic retry.

use herd_core::{FlowId, TicketId, TodoId};
use serde::{Deserialize, Serialize};

/// The result type used throughout herd-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A ticket was not found.
    #[error("ticket not found: {ticket_id}")]
    TicketNotFound {
        /// The ticket ID that was not found.
        ticket_id: TicketId,
    },

    /// A flow was not found.
    #[error("flow not found: {flow_id}")]
    FlowNotFound {
        /// The flow ID that was not found.
        flow_id: FlowId,
    },

    /// A todo was not found.
    #[error("todo not found: {todo_id}")]
    TodoNotFound {
        /// The todo ID that was not found.
        todo_id: TodoId,
    },

    /// No builder is registered for a ticket type.
    #[error("no builder registered for ticket type {ticket_type}")]
    UnknownTicketType {
        /// The unregistered ticket type token.
        ticket_type: String,
    },

    /// Ticket details failed the builder's validator.
    #[error("invalid details for {ticket_type}: {message}")]
    Validation {
        /// The ticket type whose validator rejected the details.
        ticket_type: String,
        /// Description of the validation failure.
        message: String,
    },

    /// No flow holds the given external object handle.
    #[error("no flow holds object handle {object_id}")]
    UnknownFlowObject {
        /// The orphaned handle.
        object_id: String,
    },

    /// A user acted on a todo they are not an operator or helper of.
    #[error("{user} may not act on this todo")]
    PermissionDenied {
        /// The rejected user.
        user: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// The exclusion matrix source failed to parse.
    #[error("exclusion matrix parse error at line {line}: {message}")]
    MatrixParse {
        /// One-indexed source line of the failure.
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// A collaborator (actuator, broker, gateway, ...) call failed.
    #[error("{service} call failed: {message}")]
    External {
        /// The collaborator that failed.
        service: String,
        /// Description of the failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from herd-core.
    #[error("core error: {0}")]
    Core(#[from] herd_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new external-collaborator error.
    #[must_use]
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::External {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Creates a new validation error.
    #[must_use]
    pub fn validation(ticket_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            ticket_type: ticket_type.into(),
            message: message.into(),
        }
    }
}

/// Numeric error codes persisted on failed or terminated flows.
///
/// The serialized token form matches the wire vocabulary of the callbacks
/// (`INNER_FAIL`, `SYSTEM_TERMINATED_ERROR`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Ticket details failed validation before any flow ran.
    Validation,
    /// A conflicting ticket holds an active ledger record on a shared cluster.
    InnerFail,
    /// The actuator reported a retriable failure.
    Transient,
    /// The actuator or a poll loop timed out.
    Timeout,
    /// The actuator reported a terminal workflow failure.
    WorkflowFail,
    /// The resource broker could not satisfy the request.
    ResourceLake,
    /// The core aborted a stuck awaiting-external stage.
    SystemTerminatedError,
    /// A human closed the stage's todo with DONE-FAILED.
    UserTerminated,
}

impl ErrorCode {
    /// Returns the stable numeric code for persistence and APIs.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Validation => 40001,
            Self::InnerFail => 40010,
            Self::Transient => 50001,
            Self::Timeout => 50002,
            Self::WorkflowFail => 50003,
            Self::ResourceLake => 50010,
            Self::SystemTerminatedError => 60001,
            Self::UserTerminated => 60002,
        }
    }

    /// Returns true if the code is eligible for automatic retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// Returns the wire token for this code.
    #[must_use]
    pub const fn as_token(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::InnerFail => "INNER_FAIL",
            Self::Transient => "TRANSIENT",
            Self::Timeout => "TIMEOUT",
            Self::WorkflowFail => "WORKFLOW_FAIL",
            Self::ResourceLake => "RESOURCE_LAKE",
            Self::SystemTerminatedError => "SYSTEM_TERMINATED_ERROR",
            Self::UserTerminated => "USER_TERMINATED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// The error payload carried on a failed or terminated flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowError {
    /// Numeric error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl FlowError {
    /// Creates a new flow error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates the exclusion-rejection error for a conflicting ticket.
    #[must_use]
    pub fn exclusive_with(ticket_id: TicketId) -> Self {
        Self::new(ErrorCode::InnerFail, format!("exclusive with ticket {ticket_id}"))
    }
}
