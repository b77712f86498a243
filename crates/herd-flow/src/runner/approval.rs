//! APPROVAL runner: external approval gate.

use async_trait::async_trait;

use super::{StageContext, StageOutcome, StageRunner};
use crate::error::Result;
use crate::external::{ApprovalGateway, ApprovalRequest};
use crate::flow::Flow;
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Creates an approval instance at the gateway and suspends until the
/// approval callback arrives.
#[derive(Debug, Default)]
pub struct ApprovalRunner;

#[async_trait]
impl StageRunner for ApprovalRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let request = ApprovalRequest {
            ticket_id: ticket.id.to_string(),
            ticket_type: ticket.ticket_type.to_string(),
            biz_id: ticket.biz_id,
            creator: ticket.creator.clone(),
            summary: format!("{} ({})", ticket.ticket_type, ticket.remark),
        };

        let handle = ctx.approvals.create_approval(request).await?;
        ctx.store.set_flow_object_id(flow.id, &handle).await?;
        tracing::debug!(%handle, "approval created");

        Ok(StageOutcome::AwaitingExternal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowDescriptor, FlowType};
    use crate::store::TicketStore;
    use crate::testing;
    use crate::ticket::TicketType;
    use herd_core::BizId;

    #[tokio::test]
    async fn stores_handle_and_awaits() -> Result<()> {
        let ctx = testing::stage_context();
        let ticket = Ticket::new(
            TicketType::MysqlHaApply,
            BizId::new(3),
            "alice",
            "apply",
            crate::bag::Bag::new(),
        );
        let flow = Flow::new(
            ticket.id,
            0,
            &FlowDescriptor::new(FlowType::Approval, "approval"),
        );
        ctx.store.insert_ticket(&ticket, &[flow.clone()]).await?;

        let outcome = ApprovalRunner.run(&ctx, &ticket, &flow).await?;
        assert!(matches!(outcome, StageOutcome::AwaitingExternal));

        let stored = ctx.store.get_flow(flow.id).await?.expect("flow");
        assert!(stored.flow_object_id.is_some());
        Ok(())
    }
}
