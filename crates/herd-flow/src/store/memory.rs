//! In-memory ticket store for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use herd_core::{FlowId, TicketId, TodoId};

use super::TicketStore;
use crate::bag::{self, Bag};
use crate::error::{Error, FlowError, Result};
use crate::flow::{Flow, FlowStatus};
use crate::ticket::{Ticket, TicketStatus};
use crate::todo::Todo;

#[derive(Debug, Clone)]
struct TicketRow {
    ticket: Ticket,
    flows: Vec<Flow>,
}

/// In-memory store for testing.
#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<TicketId, TicketRow>>,
    todos: RwLock<HashMap<TodoId, Todo>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

impl InMemoryTicketStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tickets currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ticket_count(&self) -> Result<usize> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets.len())
    }

    fn with_flow<T>(
        &self,
        flow_id: FlowId,
        f: impl FnOnce(&mut Flow) -> Result<T>,
    ) -> Result<T> {
        let mut tickets = self.tickets.write().map_err(poison_err)?;
        let flow = tickets
            .values_mut()
            .flat_map(|row| row.flows.iter_mut())
            .find(|flow| flow.id == flow_id)
            .ok_or(Error::FlowNotFound { flow_id })?;
        let result = f(flow);
        drop(tickets);
        result
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert_ticket(&self, ticket: &Ticket, flows: &[Flow]) -> Result<()> {
        let mut tickets = self.tickets.write().map_err(poison_err)?;
        tickets.insert(
            ticket.id,
            TicketRow {
                ticket: ticket.clone(),
                flows: flows.to_vec(),
            },
        );
        drop(tickets);
        Ok(())
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets.get(&ticket_id).map(|row| row.ticket.clone()))
    }

    async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()> {
        let mut tickets = self.tickets.write().map_err(poison_err)?;
        let row = tickets
            .get_mut(&ticket_id)
            .ok_or(Error::TicketNotFound { ticket_id })?;
        if row.ticket.status != status {
            row.ticket.status = status;
            row.ticket.updated_at = Utc::now();
        }
        drop(tickets);
        Ok(())
    }

    async fn merge_ticket_details(&self, ticket_id: TicketId, patch: &Bag) -> Result<()> {
        let mut tickets = self.tickets.write().map_err(poison_err)?;
        let row = tickets
            .get_mut(&ticket_id)
            .ok_or(Error::TicketNotFound { ticket_id })?;
        row.ticket.merge_details(patch);
        drop(tickets);
        Ok(())
    }

    async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets
            .values()
            .filter(|row| row.ticket.status == status)
            .map(|row| row.ticket.clone())
            .collect())
    }

    async fn flows_for_ticket(&self, ticket_id: TicketId) -> Result<Vec<Flow>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        let mut flows = tickets
            .get(&ticket_id)
            .map(|row| row.flows.clone())
            .unwrap_or_default();
        drop(tickets);
        flows.sort_by_key(|f| f.ordinal);
        Ok(flows)
    }

    async fn get_flow(&self, flow_id: FlowId) -> Result<Option<Flow>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets
            .values()
            .flat_map(|row| row.flows.iter())
            .find(|flow| flow.id == flow_id)
            .cloned())
    }

    async fn find_flow_by_object_id(&self, flow_object_id: &str) -> Result<Option<Flow>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets
            .values()
            .flat_map(|row| row.flows.iter())
            .find(|flow| flow.flow_object_id.as_deref() == Some(flow_object_id))
            .cloned())
    }

    async fn append_flow(&self, flow: &Flow) -> Result<()> {
        let mut tickets = self.tickets.write().map_err(poison_err)?;
        let row = tickets.get_mut(&flow.ticket_id).ok_or(Error::TicketNotFound {
            ticket_id: flow.ticket_id,
        })?;
        row.flows.push(flow.clone());
        drop(tickets);
        Ok(())
    }

    async fn update_flow_status(
        &self,
        flow_id: FlowId,
        status: FlowStatus,
        error: Option<&FlowError>,
    ) -> Result<()> {
        self.with_flow(flow_id, |flow| {
            if flow.status == status {
                return Ok(());
            }
            flow.transition_to(status)?;
            if let Some(err) = error {
                flow.set_error(err);
            }
            Ok(())
        })
    }

    async fn set_flow_object_id(&self, flow_id: FlowId, flow_object_id: &str) -> Result<()> {
        self.with_flow(flow_id, |flow| {
            flow.flow_object_id = Some(flow_object_id.to_owned());
            flow.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn merge_flow_details(&self, flow_id: FlowId, patch: &Bag) -> Result<()> {
        self.with_flow(flow_id, |flow| {
            bag::merge(&mut flow.details, patch);
            flow.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn merge_flow_context(&self, flow_id: FlowId, patch: &Bag) -> Result<()> {
        self.with_flow(flow_id, |flow| {
            bag::merge(&mut flow.context, patch);
            flow.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn flows_in_statuses(&self, statuses: &[FlowStatus]) -> Result<Vec<FlowId>> {
        let tickets = self.tickets.read().map_err(poison_err)?;
        Ok(tickets
            .values()
            .flat_map(|row| row.flows.iter())
            .filter(|flow| statuses.contains(&flow.status))
            .map(|flow| flow.id)
            .collect())
    }

    async fn current_flow(&self, ticket_id: TicketId) -> Result<Option<Flow>> {
        let flows = self.flows_for_ticket(ticket_id).await?;
        let latest_started = flows
            .iter()
            .rev()
            .find(|f| f.status != FlowStatus::Pending)
            .cloned();
        Ok(latest_started.or_else(|| {
            flows
                .iter()
                .find(|f| f.status == FlowStatus::Pending)
                .cloned()
        }))
    }

    async fn next_flow(&self, ticket_id: TicketId) -> Result<Option<Flow>> {
        let flows = self.flows_for_ticket(ticket_id).await?;
        Ok(flows
            .into_iter()
            .find(|f| f.status == FlowStatus::Pending))
    }

    async fn insert_todo(&self, todo: &Todo) -> Result<()> {
        let mut todos = self.todos.write().map_err(poison_err)?;
        todos.insert(todo.id, todo.clone());
        drop(todos);
        Ok(())
    }

    async fn get_todo(&self, todo_id: TodoId) -> Result<Option<Todo>> {
        let todos = self.todos.read().map_err(poison_err)?;
        Ok(todos.get(&todo_id).cloned())
    }

    async fn save_todo(&self, todo: &Todo) -> Result<()> {
        let mut todos = self.todos.write().map_err(poison_err)?;
        todos.insert(todo.id, todo.clone());
        drop(todos);
        Ok(())
    }

    async fn todos_for_flow(&self, flow_id: FlowId) -> Result<Vec<Todo>> {
        let todos = self.todos.read().map_err(poison_err)?;
        let mut result: Vec<Todo> = todos
            .values()
            .filter(|t| t.flow_id == flow_id)
            .cloned()
            .collect();
        drop(todos);
        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowDescriptor, FlowType};
    use crate::ticket::TicketType;
    use herd_core::BizId;

    fn seed_ticket(store_flows: &[FlowType]) -> (Ticket, Vec<Flow>) {
        let ticket = Ticket::new(
            TicketType::MysqlHaApply,
            BizId::new(3),
            "alice",
            "apply",
            Bag::new(),
        );
        let flows = store_flows
            .iter()
            .enumerate()
            .map(|(i, ft)| {
                Flow::new(
                    ticket.id,
                    u32::try_from(i).unwrap_or(u32::MAX),
                    &FlowDescriptor::new(*ft, format!("stage {i}")),
                )
            })
            .collect();
        (ticket, flows)
    }

    #[tokio::test]
    async fn insert_and_fetch() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::Approval, FlowType::InnerWorkflow]);

        store.insert_ticket(&ticket, &flows).await?;
        assert!(store.get_ticket(ticket.id).await?.is_some());
        assert_eq!(store.flows_for_ticket(ticket.id).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn next_flow_is_first_pending() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::Approval, FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        let next = store.next_flow(ticket.id).await?.expect("next flow");
        assert_eq!(next.ordinal, 0);

        store
            .update_flow_status(next.id, FlowStatus::Running, None)
            .await?;
        store
            .update_flow_status(next.id, FlowStatus::Succeeded, None)
            .await?;

        let next = store.next_flow(ticket.id).await?.expect("next flow");
        assert_eq!(next.ordinal, 1);
        Ok(())
    }

    #[tokio::test]
    async fn current_flow_prefers_latest_started() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::Approval, FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        // Nothing started: first pending.
        let current = store.current_flow(ticket.id).await?.expect("current");
        assert_eq!(current.ordinal, 0);

        store
            .update_flow_status(flows[0].id, FlowStatus::Running, None)
            .await?;
        let current = store.current_flow(ticket.id).await?.expect("current");
        assert_eq!(current.ordinal, 0);
        assert_eq!(current.status, FlowStatus::Running);

        store
            .update_flow_status(flows[0].id, FlowStatus::Succeeded, None)
            .await?;
        store
            .update_flow_status(flows[1].id, FlowStatus::Running, None)
            .await?;
        let current = store.current_flow(ticket.id).await?.expect("current");
        assert_eq!(current.ordinal, 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_status_is_noop_when_unchanged() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        // Pending -> Pending is a no-op, not an invalid transition.
        store
            .update_flow_status(flows[0].id, FlowStatus::Pending, None)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        let result = store
            .update_flow_status(flows[0].id, FlowStatus::Succeeded, None)
            .await;
        assert!(matches!(
            result,
            Err(Error::InvalidStateTransition { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn find_by_object_id() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        store.set_flow_object_id(flows[0].id, "root-42").await?;
        let found = store.find_flow_by_object_id("root-42").await?;
        assert_eq!(found.map(|f| f.id), Some(flows[0].id));
        Ok(())
    }

    #[tokio::test]
    async fn context_merge_accumulates() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::InnerWorkflow]);
        store.insert_ticket(&ticket, &flows).await?;

        let mut patch = Bag::new();
        patch.insert("a".into(), serde_json::json!(1));
        store.merge_flow_context(flows[0].id, &patch).await?;

        let mut patch = Bag::new();
        patch.insert("b".into(), serde_json::json!(2));
        store.merge_flow_context(flows[0].id, &patch).await?;

        let flow = store.get_flow(flows[0].id).await?.expect("flow");
        assert!(flow.context.contains_key("a"));
        assert!(flow.context.contains_key("b"));
        Ok(())
    }

    #[tokio::test]
    async fn todos_roundtrip() -> Result<()> {
        let store = InMemoryTicketStore::new();
        let (ticket, flows) = seed_ticket(&[FlowType::HumanConfirm]);
        store.insert_ticket(&ticket, &flows).await?;

        let todo = Todo::new(flows[0].id, ticket.id, vec!["alice".into()], vec![]);
        store.insert_todo(&todo).await?;

        let open = store.todos_for_flow(flows[0].id).await?;
        assert_eq!(open.len(), 1);
        assert!(open[0].status.is_open());
        Ok(())
    }
}
