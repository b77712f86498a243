//! Recycle and follow-up dispatching.
//!
//! When a ticket reaches a terminal status, its builder's recycling policy
//! may spawn a linked child ticket (resource return, post-failure cleanup).
//! The child goes through the ordinary `create_ticket` contract; the parent
//! records an immediate-done DELIVERY flow linking to it. All cross-ticket
//! references are id-only.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bag::Bag;
use crate::error::Result;
use crate::flow::{Flow, FlowDescriptor, FlowStatus, FlowType};
use crate::manager::FollowUpDispatcher;
use crate::registry::{CreateTicketRequest, TicketService};
use crate::runner::delivery::RELATED_TICKET_KEY;
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Creator recorded on recycle-spawned children.
pub const SYSTEM_CREATOR: &str = "system";

/// Dispatches terminal-state follow-ups through the ticket service.
pub struct RecycleDispatcher {
    service: Arc<TicketService>,
}

impl std::fmt::Debug for RecycleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecycleDispatcher").finish_non_exhaustive()
    }
}

impl RecycleDispatcher {
    /// Creates a dispatcher submitting children through `service`.
    #[must_use]
    pub fn new(service: Arc<TicketService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl FollowUpDispatcher for RecycleDispatcher {
    #[tracing::instrument(skip(self, ticket, flows), fields(ticket_id = %ticket.id, status = %ticket.status))]
    async fn on_terminal(&self, ticket: &Ticket, flows: &[Flow]) -> Result<()> {
        let Ok(builder) = self.service.registry().get(ticket.ticket_type) else {
            // Children of unregistered types (none today) have no policy.
            return Ok(());
        };
        let Some(plan) = builder.recycle(ticket, flows) else {
            return Ok(());
        };

        tracing::info!(child_type = %plan.ticket_type, "spawning recycle child");
        let child_id = self
            .service
            .create_ticket(CreateTicketRequest {
                ticket_type: plan.ticket_type,
                bk_biz_id: ticket.biz_id,
                details: plan.details,
                creator: SYSTEM_CREATOR.to_owned(),
                remark: plan.remark,
                auto_execute: true,
                helpers: vec![],
                notify_channels: ticket.config.notify_channels.clone(),
            })
            .await?;

        // Parent gets an immediate-done DELIVERY flow linking to the child.
        let next_ordinal = flows.iter().map(|f| f.ordinal + 1).max().unwrap_or(0);
        let mut details = Bag::new();
        details.insert(RELATED_TICKET_KEY.into(), json!(child_id.to_string()));
        let mut link = Flow::new(
            ticket.id,
            next_ordinal,
            &FlowDescriptor::new(FlowType::Delivery, "recycle link").with_details(details),
        );
        link.transition_to(FlowStatus::Running)?;
        link.transition_to(FlowStatus::Succeeded)?;

        let store = &self.service.manager().context().store;
        store.append_flow(&link).await?;
        Ok(())
    }
}
