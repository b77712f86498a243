//! INNER-WORKFLOW runner: the heavy-lifting path.
//!
//! Admission control happens here: before any host-level work starts, the
//! runner atomically checks every cluster the ticket touches against the
//! operation ledger and inserts records for all of them — or fails the flow
//! with `INNER_FAIL` without starting anything.

use async_trait::async_trait;
use serde_json::json;

use super::{StageContext, StageOutcome, StageRunner};
use crate::bag::Bag;
use crate::error::{ErrorCode, FlowError, Result};
use crate::external::ActuatorDispatcher;
use crate::flow::{Flow, FlowStatus};
use crate::ledger::{BeginOutcome, OperationLedger, UnlockSet};
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Key under which a completing workflow's output lands in the flow context.
pub const FLOW_OUTPUT_KEY: &str = "__flow_output_v2";

/// Starts an out-of-process workflow under the cluster mutex.
#[derive(Debug, Default)]
pub struct InnerWorkflowRunner;

impl InnerWorkflowRunner {
    /// Merges the contexts of earlier succeeded flows, in ordinal order, so
    /// outputs propagate to later stages.
    async fn accumulated_context(ctx: &StageContext, flow: &Flow) -> Result<Bag> {
        let flows = ctx.store.flows_for_ticket(flow.ticket_id).await?;
        let mut merged = Bag::new();
        for earlier in flows
            .iter()
            .filter(|f| f.ordinal < flow.ordinal && f.status == FlowStatus::Succeeded)
        {
            crate::bag::merge(&mut merged, &earlier.context);
        }
        Ok(merged)
    }

    fn unlock_set(ticket: &Ticket, flow: &Flow) -> UnlockSet {
        let flow_level: Vec<String> = flow
            .details
            .get("unlock_ticket_types")
            .and_then(|v| v.as_array())
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        if flow_level.is_empty() {
            UnlockSet::from_tokens(ticket.unlock_ticket_types())
        } else {
            UnlockSet::from_tokens(flow_level)
        }
    }
}

#[async_trait]
impl StageRunner for InnerWorkflowRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let clusters = ticket.cluster_ids();

        if !clusters.is_empty() {
            let outcome = ctx
                .ledger
                .begin_all(
                    &clusters,
                    flow.id,
                    ticket.id,
                    ticket.ticket_type,
                    Self::unlock_set(ticket, flow),
                    &[ticket.id],
                )
                .await?;

            if let BeginOutcome::Conflicted(conflicts) = outcome {
                let first = &conflicts[0];
                tracing::info!(
                    conflicting_ticket = %first.ticket_id,
                    cluster = %first.cluster_id,
                    "inner workflow rejected by exclusion"
                );
                return Ok(StageOutcome::CompletedFail(FlowError::exclusive_with(
                    first.ticket_id,
                )));
            }
        }

        let root_id = flow.id.to_string();
        let payload = json!({
            "action": crate::bag::get_str(&flow.details, "action").unwrap_or(&flow.alias),
            "ticketType": ticket.ticket_type,
            "bizId": ticket.biz_id,
            "details": ticket.details,
            "stageDetails": flow.details,
            "context": Self::accumulated_context(ctx, flow).await?,
        });

        ctx.store.set_flow_object_id(flow.id, &root_id).await?;
        if let Err(e) = ctx.actuator.start(&root_id, payload).await {
            // Failed to hand off: release the records we just took.
            ctx.ledger.end_all_for_flow(flow.id).await?;
            return Ok(StageOutcome::CompletedFail(FlowError::new(
                ErrorCode::Transient,
                format!("actuator start failed: {e}"),
            )));
        }

        tracing::debug!(%root_id, "inner workflow started");
        Ok(StageOutcome::AwaitingExternal)
    }
}
