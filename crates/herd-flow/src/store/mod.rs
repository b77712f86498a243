//! Pluggable persistence for tickets, flows, and todos.
//!
//! The [`TicketStore`] trait is pure persistence: no orchestration decisions
//! live here. Flow status writes go through [`TicketStore::update_flow_status`],
//! which validates the transition and is a no-op when the status is
//! unchanged; bag writes are append-merge, never replace.
//!
//! ## Design Principles
//!
//! - **Atomic creation**: a ticket and all its flow rows are inserted in one
//!   operation.
//! - **Separation of concerns**: persistence is independent of the ledger
//!   and of the exclusion matrix.
//! - **Testability**: in-memory implementation for tests, SQL for production.

pub mod memory;

use async_trait::async_trait;

use herd_core::{FlowId, TicketId, TodoId};

use crate::bag::Bag;
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowStatus};
use crate::ticket::{Ticket, TicketStatus};
use crate::todo::Todo;

/// Storage abstraction for orchestration state.
#[async_trait]
pub trait TicketStore: Send + Sync {
    // --- Ticket operations ---

    /// Atomically inserts a ticket and its flow rows.
    async fn insert_ticket(&self, ticket: &Ticket, flows: &[Flow]) -> Result<()>;

    /// Gets a ticket by ID. Returns `None` if it does not exist.
    async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>>;

    /// Updates a ticket's derived status. No-op if unchanged.
    async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()>;

    /// Append-merges a patch into a ticket's detail bag.
    async fn merge_ticket_details(&self, ticket_id: TicketId, patch: &Bag) -> Result<()>;

    /// Returns all tickets currently in the given status.
    async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>>;

    // --- Flow operations ---

    /// Returns a ticket's flows in ordinal order.
    async fn flows_for_ticket(&self, ticket_id: TicketId) -> Result<Vec<Flow>>;

    /// Gets a flow by ID.
    async fn get_flow(&self, flow_id: FlowId) -> Result<Option<Flow>>;

    /// Finds the flow holding an external object handle.
    async fn find_flow_by_object_id(&self, flow_object_id: &str) -> Result<Option<Flow>>;

    /// Appends a flow row to an existing ticket (used by the recycle
    /// dispatcher for DELIVERY links).
    async fn append_flow(&self, flow: &Flow) -> Result<()>;

    /// Transitions a flow's status, recording the error payload when given.
    ///
    /// A no-op when the status is unchanged; otherwise the transition is
    /// validated against the flow state machine.
    async fn update_flow_status(
        &self,
        flow_id: FlowId,
        status: FlowStatus,
        error: Option<&FlowError>,
    ) -> Result<()>;

    /// Stores the external object handle on a flow.
    async fn set_flow_object_id(&self, flow_id: FlowId, flow_object_id: &str) -> Result<()>;

    /// Append-merges a patch into a flow's detail bag.
    async fn merge_flow_details(&self, flow_id: FlowId, patch: &Bag) -> Result<()>;

    /// Append-merges a patch into a flow's context bag.
    async fn merge_flow_context(&self, flow_id: FlowId, patch: &Bag) -> Result<()>;

    /// Returns the ids of flows currently in any of the given statuses,
    /// across all tickets (used by the startup ledger sweep).
    async fn flows_in_statuses(&self, statuses: &[FlowStatus]) -> Result<Vec<FlowId>>;

    // --- Pipeline queries ---

    /// Returns the latest non-PENDING flow, or the first PENDING flow if
    /// none has started.
    async fn current_flow(&self, ticket_id: TicketId) -> Result<Option<Flow>>;

    /// Returns the first PENDING flow, or `None` when the pipeline is done.
    async fn next_flow(&self, ticket_id: TicketId) -> Result<Option<Flow>>;

    // --- Todo operations ---

    /// Inserts a todo.
    async fn insert_todo(&self, todo: &Todo) -> Result<()>;

    /// Gets a todo by ID.
    async fn get_todo(&self, todo_id: TodoId) -> Result<Option<Todo>>;

    /// Replaces a todo row (status, context, done metadata).
    async fn save_todo(&self, todo: &Todo) -> Result<()>;

    /// Returns a flow's todos, oldest first.
    async fn todos_for_flow(&self, flow_id: FlowId) -> Result<Vec<Todo>>;
}

#[cfg(test)]
mod tests {
    // Trait-level behaviour is exercised through the in-memory
    // implementation in `memory.rs`.
}
