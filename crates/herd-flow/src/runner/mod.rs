//! Stage runners: pluggable executors per flow kind.
//!
//! Each runner is a state machine for one flow. The contract is
//! `run(flow) -> StageOutcome`; a runner never persists flow status itself —
//! the manager owns that — but it may write object handles, todos, contexts,
//! and ledger records as side-effects of starting its stage.
//!
//! A flow "suspends" when its runner returns an `Awaiting*` outcome. No task
//! blocks on it; resumption is driven by an external callback or a human
//! action through the manager.

pub mod approval;
pub mod confirm;
pub mod delivery;
pub mod inner;
pub mod pause;
pub mod resource;

pub use approval::ApprovalRunner;
pub use confirm::HumanConfirmRunner;
pub use delivery::DeliveryRunner;
pub use inner::InnerWorkflowRunner;
pub use pause::PauseRunner;
pub use resource::{ResourceApplyRunner, ResourceBatchRunner};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::external::{
    ActuatorDispatcher, ApprovalGateway, InventoryRepository, Notifier, ResourceBroker,
};
use crate::flow::{Flow, FlowType};
use crate::ledger::OperationLedger;
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Result of running a stage.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The stage finished synchronously and succeeded.
    CompletedSuccess,
    /// The stage finished synchronously and failed.
    CompletedFail(FlowError),
    /// The stage opened a todo and waits for a human.
    AwaitingHuman,
    /// The stage started external work and waits for a callback.
    AwaitingExternal,
}

impl StageOutcome {
    /// Returns true for either awaiting variant.
    #[must_use]
    pub const fn is_awaiting(&self) -> bool {
        matches!(self, Self::AwaitingHuman | Self::AwaitingExternal)
    }
}

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct StageContext {
    /// Ticket/flow/todo persistence.
    pub store: Arc<dyn TicketStore>,
    /// Cluster operation ledger.
    pub ledger: Arc<dyn OperationLedger>,
    /// Host-level workflow engine.
    pub actuator: Arc<dyn ActuatorDispatcher>,
    /// External approval service.
    pub approvals: Arc<dyn ApprovalGateway>,
    /// Resource-pool allocator.
    pub broker: Arc<dyn ResourceBroker>,
    /// Read-only cluster metadata.
    pub inventory: Arc<dyn InventoryRepository>,
    /// Outbound notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Engine tunables.
    pub config: EngineConfig,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext").finish_non_exhaustive()
    }
}

/// Executor for one kind of stage.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs the stage for `flow`, returning how it left off.
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome>;
}

/// Returns the runner for a flow kind.
#[must_use]
pub fn runner_for(flow_type: FlowType) -> &'static dyn StageRunner {
    static APPROVAL: ApprovalRunner = ApprovalRunner;
    static CONFIRM: HumanConfirmRunner = HumanConfirmRunner;
    static INNER: InnerWorkflowRunner = InnerWorkflowRunner;
    static DELIVERY: DeliveryRunner = DeliveryRunner;
    static PAUSE: PauseRunner = PauseRunner;
    static RESOURCE: ResourceApplyRunner = ResourceApplyRunner;
    static RESOURCE_BATCH: ResourceBatchRunner = ResourceBatchRunner;

    match flow_type {
        FlowType::Approval => &APPROVAL,
        FlowType::HumanConfirm => &CONFIRM,
        FlowType::InnerWorkflow => &INNER,
        FlowType::Delivery => &DELIVERY,
        FlowType::PauseWithLockCheck => &PAUSE,
        FlowType::ResourceApply => &RESOURCE,
        FlowType::ResourceBatch => &RESOURCE_BATCH,
    }
}

/// Resolves the operator set for a ticket's human gates: the business's DBAs
/// with a fallback to the platform DBAs.
pub(crate) async fn resolve_operators(ctx: &StageContext, ticket: &Ticket) -> Result<Vec<String>> {
    let biz = ctx.inventory.biz_dba(ticket.biz_id).await?;
    if biz.is_empty() {
        ctx.inventory.platform_dba().await
    } else {
        Ok(biz)
    }
}
