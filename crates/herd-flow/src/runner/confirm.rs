//! HUMAN-CONFIRM runner: opens a todo for the ticket's operator set.

use async_trait::async_trait;

use super::{resolve_operators, StageContext, StageOutcome, StageRunner};
use crate::error::Result;
use crate::flow::Flow;
use crate::store::TicketStore;
use crate::ticket::Ticket;
use crate::todo::Todo;

/// Opens a confirmation todo addressed to the business DBAs (falling back to
/// the platform DBAs) plus the ticket's helpers, then suspends.
#[derive(Debug, Default)]
pub struct HumanConfirmRunner;

#[async_trait]
impl StageRunner for HumanConfirmRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let operators = resolve_operators(ctx, ticket).await?;
        let todo = Todo::new(
            flow.id,
            ticket.id,
            operators,
            ticket.config.helpers.clone(),
        );
        ctx.store.insert_todo(&todo).await?;
        tracing::debug!(todo_id = %todo.id, "confirmation todo opened");

        Ok(StageOutcome::AwaitingHuman)
    }
}
