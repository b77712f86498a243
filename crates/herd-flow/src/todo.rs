//! Todos: human action items attached to flows.
//!
//! A flow awaiting human input holds one or more todos. The flow stays
//! RUNNING while any todo is open; closing a todo with DONE-FAILED is how a
//! human terminates the ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{FlowId, TicketId, TodoId};

use crate::bag::Bag;

/// Termination reason used when the core aborts a stuck external stage.
pub const TIMEOUT_AUTO_TERMINATE: &str = "timeout auto-terminate";

/// Todo status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TodoStatus {
    /// Awaiting a human.
    Todo,
    /// Closed affirmatively.
    DoneSuccess,
    /// Closed negatively (terminates the flow).
    DoneFailed,
}

impl TodoStatus {
    /// Returns true if the todo is still open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Todo)
    }
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "TODO"),
            Self::DoneSuccess => write!(f, "DONE_SUCCESS"),
            Self::DoneFailed => write!(f, "DONE_FAILED"),
        }
    }
}

/// A human action item on a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    /// Unique todo identifier.
    pub id: TodoId,
    /// The flow this todo gates.
    pub flow_id: FlowId,
    /// The owning ticket, for summary queries.
    pub ticket_id: TicketId,
    /// Humans who may act on this todo.
    pub operators: Vec<String>,
    /// Additional humans allowed to act.
    pub helpers: Vec<String>,
    /// Status.
    pub status: TodoStatus,
    /// Ad-hoc context (e.g. a pause wait message or termination remark).
    pub context: Bag,
    /// Who closed the todo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_by: Option<String>,
    /// Remark supplied when closing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    /// When the todo was created.
    pub created_at: DateTime<Utc>,
    /// When the todo was closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
}

impl Todo {
    /// Creates an open todo.
    #[must_use]
    pub fn new(
        flow_id: FlowId,
        ticket_id: TicketId,
        operators: Vec<String>,
        helpers: Vec<String>,
    ) -> Self {
        Self {
            id: TodoId::generate(),
            flow_id,
            ticket_id,
            operators,
            helpers,
            status: TodoStatus::Todo,
            context: Bag::new(),
            done_by: None,
            remark: None,
            created_at: Utc::now(),
            done_at: None,
        }
    }

    /// Closes the todo.
    pub fn close(&mut self, status: TodoStatus, done_by: impl Into<String>, remark: Option<String>) {
        self.status = status;
        self.done_by = Some(done_by.into());
        self.remark = remark;
        self.done_at = Some(Utc::now());
    }

    /// Returns true if `user` may act on this todo.
    #[must_use]
    pub fn allows(&self, user: &str) -> bool {
        self.operators.iter().any(|o| o == user) || self.helpers.iter().any(|h| h == user)
    }
}

/// Formats the user-facing reason for a manual termination.
#[must_use]
pub fn format_terminate_reason(done_by: &str, remark: &str) -> String {
    format!("{done_by} handled (manual terminate, remark: {remark})")
}
