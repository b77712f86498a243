//! PAUSE-WITH-LOCK-CHECK runner.
//!
//! The only stage that is both a human gate and a mutex re-evaluation point.
//! On entry it parks a paused ledger record on every cluster the ticket
//! touches and may retract unlock tokens granted by earlier stages; the
//! manager's confirm path later calls [`has_exclusive_operations_pause`] to
//! decide whether the gate may open.

use async_trait::async_trait;

use super::{resolve_operators, StageContext, StageOutcome, StageRunner};
use crate::error::Result;
use crate::flow::Flow;
use crate::ledger::{ConflictInfo, OperationLedger, RecordHandle, UnlockSet};
use crate::store::TicketStore;
use crate::ticket::Ticket;
use crate::todo::Todo;

/// Detail key naming the unlock tokens to retract while paused.
pub const RELEASE_UNLOCK_KEY: &str = "release_unlock_ticket_type_list";

/// Parks paused records, optionally re-engages the mutex for released types,
/// and opens a continuation todo.
#[derive(Debug, Default)]
pub struct PauseRunner;

#[async_trait]
impl StageRunner for PauseRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        // 1. A paused record per cluster.
        for cluster_id in ticket.cluster_ids() {
            let handle = ctx
                .ledger
                .begin(
                    cluster_id,
                    flow.id,
                    ticket.id,
                    ticket.ticket_type,
                    UnlockSet::new(),
                )
                .await?;
            ctx.ledger.mark_paused(&handle, true).await?;
        }

        // 2. Re-engage the mutex for types unlocked by earlier stages.
        let release: Vec<String> = flow
            .details
            .get(RELEASE_UNLOCK_KEY)
            .and_then(|v| v.as_array())
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        if !release.is_empty() {
            for record in ctx.ledger.records_for_ticket(ticket.id).await? {
                ctx.ledger
                    .retract_unlock(&record.handle(), &release)
                    .await?;
            }
            tracing::debug!(released = release.len(), "unlock tokens retracted");
        }

        // 3. Human gate.
        let operators = resolve_operators(ctx, ticket).await?;
        let todo = Todo::new(
            flow.id,
            ticket.id,
            operators,
            ticket.config.helpers.clone(),
        );
        ctx.store.insert_todo(&todo).await?;

        Ok(StageOutcome::AwaitingHuman)
    }
}

/// Re-runs the conflict scan for every paused record held by `flow_id`,
/// excluding other paused records and the ticket itself.
///
/// Returns the remaining conflicts; empty means the gate may open.
pub async fn has_exclusive_operations_pause(
    ledger: &dyn OperationLedger,
    ticket: &Ticket,
    flow: &Flow,
) -> Result<Vec<ConflictInfo>> {
    let mut conflicts = Vec::new();
    for record in ledger.records_for_ticket(ticket.id).await? {
        if record.flow_id != flow.id || !record.is_paused {
            continue;
        }
        conflicts.extend(ledger.conflicts_for_pause(&record.handle()).await?);
    }
    Ok(conflicts)
}

/// Flips every paused record of `flow_id` live again (gate opened).
pub async fn release_pause_records(
    ledger: &dyn OperationLedger,
    ticket: &Ticket,
    flow: &Flow,
) -> Result<Vec<RecordHandle>> {
    let mut released = Vec::new();
    for record in ledger.records_for_ticket(ticket.id).await? {
        if record.flow_id != flow.id || !record.is_paused {
            continue;
        }
        let handle = record.handle();
        ledger.mark_paused(&handle, false).await?;
        released.push(handle);
    }
    Ok(released)
}
