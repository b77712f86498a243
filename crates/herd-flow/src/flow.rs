//! Flow model: one stage of a ticket's pipeline.
//!
//! Flows execute strictly sequentially by ordinal within a ticket. The state
//! machine:
//!
//! ```text
//! ┌─────────┐   started    ┌─────────┐
//! │ PENDING │─────────────►│ RUNNING │
//! └─────────┘              └─────────┘
//!      │                        │
//!   skipped      ┌──────────┬───┴──────┬────────────┐
//!      │         ▼          ▼          ▼            ▼
//!      │   ┌───────────┐ ┌────────┐ ┌─────────┐ ┌────────────┐
//!      └──►│  SKIPPED  │ │ FAILED │ │ REVOKED │ │ TERMINATED │
//!          └───────────┘ └────────┘ └─────────┘ └────────────┘
//!                            │
//!                        retry (explicit)
//!                            │
//!                            ▼
//!                       ┌─────────┐      ┌───────────┐
//!                       │ RUNNING │─────►│ SUCCEEDED │
//!                       └─────────┘      └───────────┘
//! ```
//!
//! SUCCEEDED is terminal-forward: nothing moves a succeeded flow again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{FlowId, TicketId};

use crate::bag::{self, Bag};
use crate::error::{Error, FlowError, Result};

/// The kind of stage a flow represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    /// External approval gate.
    Approval,
    /// Human confirmation todo.
    HumanConfirm,
    /// Out-of-process workflow driven by the actuator.
    InnerWorkflow,
    /// Bookkeeping stage linking tickets and emitting notifications.
    Delivery,
    /// Human gate that re-evaluates the cluster mutex before proceeding.
    PauseWithLockCheck,
    /// Allocate hosts from the resource pool.
    ResourceApply,
    /// Allocate several host groups from the resource pool.
    ResourceBatch,
}

impl FlowType {
    /// Returns true for stages inserted by flow-config policy rather than
    /// the ticket builder.
    #[must_use]
    pub const fn is_policy_gate(&self) -> bool {
        matches!(self, Self::Approval | Self::HumanConfirm)
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approval => write!(f, "APPROVAL"),
            Self::HumanConfirm => write!(f, "HUMAN_CONFIRM"),
            Self::InnerWorkflow => write!(f, "INNER_WORKFLOW"),
            Self::Delivery => write!(f, "DELIVERY"),
            Self::PauseWithLockCheck => write!(f, "PAUSE_WITH_LOCK_CHECK"),
            Self::ResourceApply => write!(f, "RESOURCE_APPLY"),
            Self::ResourceBatch => write!(f, "RESOURCE_BATCH"),
        }
    }
}

/// Flow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Waiting for its turn in the pipeline.
    Pending,
    /// Executing, or awaiting a human/external callback.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed; may be retried explicitly (or automatically if transient).
    Failed,
    /// Approval was rejected.
    Revoked,
    /// Skipped by policy or the development toggle.
    Skipped,
    /// Terminated by a human or by the core.
    Terminated,
}

impl FlowStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Revoked | Self::Skipped | Self::Terminated
        )
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// FAILED → RUNNING is the explicit-retry edge; everything else follows
    /// the diagram in the module docs.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Skipped | Self::Terminated),
            Self::Running => matches!(
                target,
                Self::Succeeded | Self::Failed | Self::Revoked | Self::Terminated
            ),
            Self::Failed => matches!(target, Self::Running | Self::Terminated),
            Self::Succeeded | Self::Revoked | Self::Skipped | Self::Terminated => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Revoked => "revoked",
            Self::Skipped => "skipped",
            Self::Terminated => "terminated",
        }
    }
}

impl Default for FlowStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Revoked => write!(f, "REVOKED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Retry policy for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryPolicy {
    /// Only a human may retry.
    Manual,
    /// The manager re-runs automatically when the failure is transient.
    AutoOnTransient,
    /// Retry is disabled.
    None,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Manual
    }
}

/// Template for one flow, emitted by a ticket builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDescriptor {
    /// Stage kind.
    pub flow_type: FlowType,
    /// Human-readable alias shown in summaries.
    pub alias: String,
    /// Retry policy.
    pub retry_policy: RetryPolicy,
    /// Stage inputs.
    pub details: Bag,
}

impl FlowDescriptor {
    /// Creates a descriptor with default retry policy and empty details.
    #[must_use]
    pub fn new(flow_type: FlowType, alias: impl Into<String>) -> Self {
        Self {
            flow_type,
            alias: alias.into(),
            retry_policy: RetryPolicy::default(),
            details: Bag::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the stage inputs.
    #[must_use]
    pub fn with_details(mut self, details: Bag) -> Self {
        self.details = details;
        self
    }
}

/// One stage in a ticket's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Unique flow identifier.
    pub id: FlowId,
    /// Parent ticket.
    pub ticket_id: TicketId,
    /// Position in the pipeline (0-indexed, creation order).
    pub ordinal: u32,
    /// Stage kind.
    pub flow_type: FlowType,
    /// Human-readable alias.
    pub alias: String,
    /// Opaque handle to the externally-running approval/workflow instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_object_id: Option<String>,
    /// Execution status.
    pub status: FlowStatus,
    /// Error message, when failed or terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
    /// Numeric error code, when failed or terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_code: Option<crate::error::ErrorCode>,
    /// Retry policy.
    pub retry_policy: RetryPolicy,
    /// Stage inputs.
    pub details: Bag,
    /// Stage outputs, propagated to later stages.
    pub context: Bag,
    /// When the flow row was created.
    pub created_at: DateTime<Utc>,
    /// When the flow last changed.
    pub updated_at: DateTime<Utc>,
    /// When the flow entered RUNNING.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the flow reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Flow {
    /// Creates a pending flow from a descriptor.
    #[must_use]
    pub fn new(ticket_id: TicketId, ordinal: u32, descriptor: &FlowDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: FlowId::generate(),
            ticket_id,
            ordinal,
            flow_type: descriptor.flow_type,
            alias: descriptor.alias.clone(),
            flow_object_id: None,
            status: FlowStatus::Pending,
            err_msg: None,
            err_code: None,
            retry_policy: descriptor.retry_policy,
            details: descriptor.details.clone(),
            context: Bag::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true if the flow is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new status, recording timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(flow_id = %self.id, from = %self.status, to = %target))]
    pub fn transition_to(&mut self, target: FlowStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "invalid flow status transition".into(),
            });
        }

        let now = Utc::now();
        match target {
            FlowStatus::Running => {
                self.started_at = Some(now);
                // A retry clears the previous failure.
                self.err_msg = None;
                self.err_code = None;
            }
            _ if target.is_terminal() => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Records a failure payload on the flow.
    pub fn set_error(&mut self, error: &FlowError) {
        self.err_msg = Some(error.message.clone());
        self.err_code = Some(error.code);
        self.updated_at = Utc::now();
    }

    /// Returns true if this flow may be retried now.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.status == FlowStatus::Failed && !matches!(self.retry_policy, RetryPolicy::None)
    }

    /// Append-merges a patch into the detail bag.
    pub fn merge_details(&mut self, patch: &Bag) {
        bag::merge(&mut self.details, patch);
        self.updated_at = Utc::now();
    }

    /// Append-merges a patch into the context bag.
    pub fn merge_context(&mut self, patch: &Bag) {
        bag::merge(&mut self.context, patch);
        self.updated_at = Utc::now();
    }
}
