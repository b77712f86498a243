//! DELIVERY runner: bookkeeping stage.

use async_trait::async_trait;

use super::{StageContext, StageOutcome, StageRunner};
use crate::error::Result;
use crate::external::Notifier;
use crate::flow::Flow;
use crate::ticket::Ticket;

/// Detail key naming a linked ticket (recycle child, follow-up, ...).
pub const RELATED_TICKET_KEY: &str = "related_ticket";

/// Associates the ticket with a related ticket, notifies the configured
/// channels, and completes immediately.
#[derive(Debug, Default)]
pub struct DeliveryRunner;

#[async_trait]
impl StageRunner for DeliveryRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let related = crate::bag::get_str(&flow.details, RELATED_TICKET_KEY);

        if !ticket.config.notify_channels.is_empty() {
            let body = match related {
                Some(related) => format!(
                    "ticket {} ({}) delivered, linked to {related}",
                    ticket.id, ticket.ticket_type
                ),
                None => format!("ticket {} ({}) delivered", ticket.id, ticket.ticket_type),
            };
            ctx.notifier
                .send("ticket delivered", &body, &ticket.config.notify_channels)
                .await?;
        }

        Ok(StageOutcome::CompletedSuccess)
    }
}
