//! Flow manager: drives tickets through their pipelines.
//!
//! Single entry point [`FlowManager::run_next_flow`] plus the callback and
//! human-action surfaces. Within one ticket, flows execute strictly
//! sequentially by ordinal; at most one flow is RUNNING at a time. Across
//! tickets the only ordering comes from the exclusion matrix via the ledger.
//!
//! The manager owns all flow status persistence. Runners start stages and
//! return a [`StageOutcome`]; the manager applies it, recomputes the derived
//! ticket status, tears down ledger records in a terminal-state finalizer,
//! and hands terminal tickets to the follow-up dispatcher.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use herd_core::{TicketId, TodoId};

use crate::bag::Bag;
use crate::error::{Error, ErrorCode, FlowError, Result};
use crate::external::{ActuatorDispatcher, Notifier};
use crate::flow::{Flow, FlowStatus, FlowType, RetryPolicy};
use crate::ledger::OperationLedger;
use crate::metrics;
use crate::store::TicketStore;
use crate::runner::inner::FLOW_OUTPUT_KEY;
use crate::runner::pause::{has_exclusive_operations_pause, release_pause_records};
use crate::runner::{runner_for, StageContext, StageOutcome};
use crate::ticket::{Ticket, TicketStatus};
use crate::todo::{format_terminate_reason, TodoStatus, TIMEOUT_AUTO_TERMINATE};

/// Dispatched when a ticket reaches a terminal status (recycle linkage,
/// follow-up tickets). Injected after construction to break the
/// manager/service cycle; cross-ticket references stay id-only.
#[async_trait]
pub trait FollowUpDispatcher: Send + Sync {
    /// Called once per ticket, on its first transition into a terminal
    /// status.
    async fn on_terminal(&self, ticket: &Ticket, flows: &[Flow]) -> Result<()>;
}

/// Result token in a workflow completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackResult {
    /// Workflow finished successfully.
    Succeeded,
    /// Workflow failed terminally (or transiently, see `transient`).
    Failed,
    /// Workflow was revoked/cancelled.
    Revoked,
}

/// `POST workflow-callback` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCallback {
    /// Root id of the finished workflow tree.
    pub root_id: String,
    /// Outcome.
    pub result: CallbackResult,
    /// True when a failure is retriable.
    #[serde(default)]
    pub transient: bool,
    /// Failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Workflow output, written into the flow context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Result token in an approval callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResult {
    /// The approval was granted.
    Approved,
    /// The approval was rejected.
    Rejected,
}

/// `POST approval-callback` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalCallback {
    /// The approval handle returned at creation.
    pub handle: String,
    /// Outcome.
    pub result: ApprovalResult,
}

/// Outcome of a todo confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The gate opened; the pipeline advanced.
    Proceeded,
    /// A pause gate is still blocked; the todo stays open.
    Waiting(String),
    /// The todo was closed negatively; the ticket terminated.
    Terminated,
}

/// Status summary for `GET ticket/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketSummary {
    /// Ticket id.
    pub ticket_id: TicketId,
    /// Ticket type token.
    pub ticket_type: String,
    /// Derived status.
    pub status: TicketStatus,
    /// Alias of the current flow, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow: Option<String>,
    /// Status of the current flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow_status: Option<FlowStatus>,
    /// Operators of the current flow's open todos.
    pub operators: Vec<String>,
    /// Helpers of the current flow's open todos.
    pub helpers: Vec<String>,
    /// Wall-clock seconds since creation (frozen at terminal states).
    pub cost_time: i64,
    /// Termination reason, when terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_reason: Option<String>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("manager lock poisoned")
}

/// Drives tickets through their pipelines.
pub struct FlowManager {
    ctx: StageContext,
    follow_up: RwLock<Option<Arc<dyn FollowUpDispatcher>>>,
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager").finish_non_exhaustive()
    }
}

impl FlowManager {
    /// Creates a manager over the given collaborators.
    #[must_use]
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            follow_up: RwLock::new(None),
        }
    }

    /// Returns the manager's stage context.
    #[must_use]
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Injects the follow-up dispatcher (recycle linkage).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the handle lock is poisoned.
    pub fn set_follow_up(&self, dispatcher: Arc<dyn FollowUpDispatcher>) -> Result<()> {
        let mut slot = self.follow_up.write().map_err(poison_err)?;
        *slot = Some(dispatcher);
        Ok(())
    }

    /// Crash-recovery sweep: deletes every ledger record whose flow is no
    /// longer RUNNING or FAILED. Run once at process start.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn startup_sweep(&self) -> Result<usize> {
        let live: HashSet<_> = self
            .ctx
            .store
            .flows_in_statuses(&[FlowStatus::Running, FlowStatus::Failed])
            .await?
            .into_iter()
            .collect();
        self.ctx.ledger.sweep(&live).await
    }

    async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket> {
        self.ctx
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or(Error::TicketNotFound { ticket_id })
    }

    async fn flow(&self, flow_id: herd_core::FlowId) -> Result<Flow> {
        self.ctx
            .store
            .get_flow(flow_id)
            .await?
            .ok_or(Error::FlowNotFound { flow_id })
    }

    /// Recomputes and persists the derived ticket status; fires the
    /// terminal-state side effects on the first transition into a terminal
    /// status.
    async fn refresh_ticket_status(&self, ticket_id: TicketId) -> Result<TicketStatus> {
        let ticket = self.ticket(ticket_id).await?;
        let flows = self.ctx.store.flows_for_ticket(ticket_id).await?;
        let derived = TicketStatus::derive(&flows);

        if derived != ticket.status {
            self.ctx
                .store
                .update_ticket_status(ticket_id, derived)
                .await?;

            if derived.is_terminal() {
                metrics::record_ticket_terminal(&derived.to_string());
                self.on_terminal(&ticket, &flows, derived).await?;
            }
        }
        Ok(derived)
    }

    async fn on_terminal(
        &self,
        ticket: &Ticket,
        flows: &[Flow],
        status: TicketStatus,
    ) -> Result<()> {
        tracing::info!(ticket_id = %ticket.id, %status, "ticket reached terminal status");

        if !ticket.config.notify_channels.is_empty() {
            let body = format!(
                "ticket {} ({}) finished with status {status}",
                ticket.id, ticket.ticket_type
            );
            self.ctx
                .notifier
                .send("ticket finished", &body, &ticket.config.notify_channels)
                .await?;
        }

        let dispatcher = {
            let slot = self.follow_up.read().map_err(poison_err)?;
            slot.clone()
        };
        if let Some(dispatcher) = dispatcher {
            let mut ticket = ticket.clone();
            ticket.status = status;
            dispatcher.on_terminal(&ticket, flows).await?;
        }
        Ok(())
    }

    /// Moves a flow into a terminal status and tears down its ledger records
    /// when it leaves RUNNING/FAILED.
    async fn finish_flow(
        &self,
        flow: &Flow,
        status: FlowStatus,
        error: Option<&FlowError>,
    ) -> Result<()> {
        self.ctx
            .store
            .update_flow_status(flow.id, status, error)
            .await?;
        metrics::record_flow_transition(status.as_label());

        if !matches!(status, FlowStatus::Running | FlowStatus::Failed) {
            self.ctx.ledger.end_all_for_flow(flow.id).await?;
        }
        self.refresh_ticket_status(flow.ticket_id).await?;
        Ok(())
    }

    /// Runs a flow's runner (the flow must already be RUNNING) and persists
    /// the outcome, applying AUTO-ON-TRANSIENT retries. Returns the flow's
    /// status afterwards.
    async fn execute_flow(
        &self,
        ticket_id: TicketId,
        flow_id: herd_core::FlowId,
    ) -> Result<FlowStatus> {
        let mut attempt: u32 = 0;

        loop {
            let ticket = self.ticket(ticket_id).await?;
            let flow = self.flow(flow_id).await?;
            let outcome = runner_for(flow.flow_type)
                .run(&self.ctx, &ticket, &flow)
                .await?;

            match outcome {
                StageOutcome::CompletedSuccess => {
                    self.finish_flow(&flow, FlowStatus::Succeeded, None).await?;
                    return Ok(FlowStatus::Succeeded);
                }
                StageOutcome::CompletedFail(err) => {
                    if err.code == ErrorCode::InnerFail {
                        metrics::record_exclusion_rejection(ticket.ticket_type.as_token());
                    }
                    self.ctx
                        .store
                        .update_flow_status(flow_id, FlowStatus::Failed, Some(&err))
                        .await?;
                    metrics::record_flow_transition(FlowStatus::Failed.as_label());
                    self.refresh_ticket_status(ticket_id).await?;

                    let auto = flow.retry_policy == RetryPolicy::AutoOnTransient
                        && err.code.is_transient()
                        && attempt < self.ctx.config.max_auto_retries;
                    if auto {
                        attempt += 1;
                        tracing::info!(%flow_id, attempt, "auto-retrying transient failure");
                        tokio::time::sleep(self.ctx.config.auto_retry_backoff()).await;
                        self.ctx
                            .store
                            .update_flow_status(flow_id, FlowStatus::Running, None)
                            .await?;
                        continue;
                    }
                    return Ok(FlowStatus::Failed);
                }
                StageOutcome::AwaitingHuman | StageOutcome::AwaitingExternal => {
                    self.refresh_ticket_status(ticket_id).await?;
                    return Ok(FlowStatus::Running);
                }
            }
        }
    }

    /// Advances a ticket: picks the next pending flow, runs it, and repeats
    /// while stages complete synchronously. Suspends (returns) when a stage
    /// awaits a callback or a human, fails, or the pipeline is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the ticket does not exist or storage fails.
    #[tracing::instrument(skip(self), fields(ticket_id = %ticket_id))]
    pub async fn run_next_flow(&self, ticket_id: TicketId) -> Result<()> {
        loop {
            let Some(flow) = self.ctx.store.next_flow(ticket_id).await? else {
                // Pipeline exhausted: derive and persist the terminal status.
                self.refresh_ticket_status(ticket_id).await?;
                return Ok(());
            };

            if self.ctx.config.dev_skip_approval_confirm && flow.flow_type.is_policy_gate() {
                self.ctx
                    .store
                    .update_flow_status(flow.id, FlowStatus::Skipped, None)
                    .await?;
                continue;
            }

            self.ctx
                .store
                .update_flow_status(flow.id, FlowStatus::Running, None)
                .await?;
            metrics::record_flow_transition(FlowStatus::Running.as_label());
            self.refresh_ticket_status(ticket_id).await?;

            if self.execute_flow(ticket_id, flow.id).await? != FlowStatus::Succeeded {
                return Ok(());
            }
        }
    }

    /// Applies a workflow completion callback.
    ///
    /// Idempotent: a callback for a flow that already left RUNNING is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFlowObject`] when no flow holds the root id.
    #[tracing::instrument(skip(self, callback), fields(root_id = %callback.root_id))]
    pub async fn handle_workflow_callback(&self, callback: WorkflowCallback) -> Result<()> {
        let flow = self
            .ctx
            .store
            .find_flow_by_object_id(&callback.root_id)
            .await?
            .ok_or_else(|| Error::UnknownFlowObject {
                object_id: callback.root_id.clone(),
            })?;

        if flow.status != FlowStatus::Running {
            tracing::debug!(flow_id = %flow.id, status = %flow.status, "duplicate callback ignored");
            return Ok(());
        }

        if let Some(output) = &callback.output {
            let mut patch = Bag::new();
            patch.insert(FLOW_OUTPUT_KEY.into(), output.clone());
            self.ctx.store.merge_flow_context(flow.id, &patch).await?;
        }

        match callback.result {
            CallbackResult::Succeeded => {
                self.finish_flow(&flow, FlowStatus::Succeeded, None).await?;
                self.run_next_flow(flow.ticket_id).await
            }
            CallbackResult::Revoked => {
                let err = FlowError::new(
                    ErrorCode::UserTerminated,
                    callback
                        .message
                        .unwrap_or_else(|| "workflow revoked".to_owned()),
                );
                self.finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                    .await
            }
            CallbackResult::Failed => {
                let code = if callback.transient {
                    ErrorCode::Transient
                } else {
                    ErrorCode::WorkflowFail
                };
                let err = FlowError::new(
                    code,
                    callback
                        .message
                        .unwrap_or_else(|| "workflow failed".to_owned()),
                );
                self.ctx
                    .store
                    .update_flow_status(flow.id, FlowStatus::Failed, Some(&err))
                    .await?;
                metrics::record_flow_transition(FlowStatus::Failed.as_label());
                self.refresh_ticket_status(flow.ticket_id).await?;

                if flow.retry_policy == RetryPolicy::AutoOnTransient && code.is_transient() {
                    tokio::time::sleep(self.ctx.config.auto_retry_backoff()).await;
                    self.ctx
                        .store
                        .update_flow_status(flow.id, FlowStatus::Running, None)
                        .await?;
                    if self.execute_flow(flow.ticket_id, flow.id).await? == FlowStatus::Succeeded {
                        return self.run_next_flow(flow.ticket_id).await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Applies an approval callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFlowObject`] when no flow holds the handle.
    #[tracing::instrument(skip(self, callback), fields(handle = %callback.handle))]
    pub async fn handle_approval_callback(&self, callback: ApprovalCallback) -> Result<()> {
        let flow = self
            .ctx
            .store
            .find_flow_by_object_id(&callback.handle)
            .await?
            .ok_or_else(|| Error::UnknownFlowObject {
                object_id: callback.handle.clone(),
            })?;

        if flow.status != FlowStatus::Running {
            return Ok(());
        }

        match callback.result {
            ApprovalResult::Approved => {
                self.finish_flow(&flow, FlowStatus::Succeeded, None).await?;
                self.run_next_flow(flow.ticket_id).await
            }
            ApprovalResult::Rejected => {
                self.finish_flow(&flow, FlowStatus::Revoked, None).await
            }
        }
    }

    /// Resolves a todo.
    ///
    /// - `success = true` on an ordinary confirm gate closes the todo and
    ///   advances the pipeline.
    /// - `success = true` on a PAUSE gate first re-checks the mutex; if
    ///   conflicts remain, the todo stays open and the blocking ticket is
    ///   surfaced.
    /// - `success = false` terminates the flow and therefore the ticket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when `done_by` is neither an
    /// operator nor a helper, and an invalid-transition error when the todo
    /// is already closed.
    #[tracing::instrument(skip(self, remark), fields(todo_id = %todo_id, done_by = %done_by))]
    pub async fn confirm_todo(
        &self,
        todo_id: TodoId,
        done_by: &str,
        success: bool,
        remark: Option<String>,
    ) -> Result<ConfirmOutcome> {
        let mut todo = self
            .ctx
            .store
            .get_todo(todo_id)
            .await?
            .ok_or(Error::TodoNotFound { todo_id })?;

        if !todo.status.is_open() {
            return Err(Error::InvalidStateTransition {
                from: todo.status.to_string(),
                to: if success { "DONE_SUCCESS" } else { "DONE_FAILED" }.to_owned(),
                reason: "todo already closed".into(),
            });
        }
        if !todo.allows(done_by) {
            return Err(Error::PermissionDenied {
                user: done_by.to_owned(),
            });
        }

        let flow = self.flow(todo.flow_id).await?;
        let ticket = self.ticket(todo.ticket_id).await?;

        if success {
            if flow.flow_type == FlowType::PauseWithLockCheck {
                let conflicts =
                    has_exclusive_operations_pause(self.ctx.ledger.as_ref(), &ticket, &flow)
                        .await?;
                if let Some(first) = conflicts.first() {
                    let message = format!("waiting on ticket {}", first.ticket_id);
                    todo.context
                        .insert("wait_message".into(), serde_json::json!(message));
                    todo.context.insert(
                        "continue_requested_by".into(),
                        serde_json::json!(done_by),
                    );
                    self.ctx.store.save_todo(&todo).await?;
                    tracing::info!(%message, "pause gate still blocked");
                    return Ok(ConfirmOutcome::Waiting(message));
                }
                release_pause_records(self.ctx.ledger.as_ref(), &ticket, &flow).await?;
            }

            todo.close(TodoStatus::DoneSuccess, done_by, remark);
            self.ctx.store.save_todo(&todo).await?;

            let still_open = self
                .ctx
                .store
                .todos_for_flow(flow.id)
                .await?
                .iter()
                .any(|t| t.status.is_open());
            if !still_open {
                self.finish_flow(&flow, FlowStatus::Succeeded, None).await?;
                self.run_next_flow(ticket.id).await?;
            }
            Ok(ConfirmOutcome::Proceeded)
        } else {
            let remark_text = remark.clone().unwrap_or_default();
            todo.close(TodoStatus::DoneFailed, done_by, remark);
            self.ctx.store.save_todo(&todo).await?;

            let err = FlowError::new(
                ErrorCode::UserTerminated,
                format_terminate_reason(done_by, &remark_text),
            );
            self.finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                .await?;
            Ok(ConfirmOutcome::Terminated)
        }
    }

    /// User-initiated termination of the current flow.
    ///
    /// A flow awaiting a human closes its todo with DONE-FAILED. A flow
    /// awaiting an external workflow requests cancellation; if the workflow
    /// does not terminate within the configured window, the flow is marked
    /// with `SYSTEM_TERMINATED_ERROR` and the ticket terminates with reason
    /// "timeout auto-terminate".
    ///
    /// # Errors
    ///
    /// Returns an invalid-transition error when the current flow cannot be
    /// terminated.
    #[tracing::instrument(skip(self, remark), fields(ticket_id = %ticket_id, operator = %operator))]
    pub async fn terminate(
        &self,
        ticket_id: TicketId,
        operator: &str,
        remark: &str,
    ) -> Result<()> {
        let flow = self
            .ctx
            .store
            .current_flow(ticket_id)
            .await?
            .ok_or(Error::TicketNotFound { ticket_id })?;

        match flow.status {
            FlowStatus::Running => {
                let open_todo = self
                    .ctx
                    .store
                    .todos_for_flow(flow.id)
                    .await?
                    .into_iter()
                    .find(|t| t.status.is_open());

                if let Some(todo) = open_todo {
                    // Awaiting human: terminate through the todo.
                    let mut todo = todo;
                    todo.close(TodoStatus::DoneFailed, operator, Some(remark.to_owned()));
                    self.ctx.store.save_todo(&todo).await?;

                    let err = FlowError::new(
                        ErrorCode::UserTerminated,
                        format_terminate_reason(operator, remark),
                    );
                    return self
                        .finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                        .await;
                }

                if let Some(root_id) = flow.flow_object_id.clone() {
                    // Awaiting external: request cancellation, bounded wait.
                    self.ctx.actuator.cancel(&root_id).await?;

                    let interval = self.ctx.config.cancel_poll_interval();
                    let deadline = Utc::now()
                        + chrono::Duration::from_std(self.ctx.config.cancel_window())
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));

                    while Utc::now() < deadline {
                        if self.ctx.actuator.status(&root_id).await?.is_terminal() {
                            let err = FlowError::new(
                                ErrorCode::UserTerminated,
                                format_terminate_reason(operator, remark),
                            );
                            return self
                                .finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                                .await;
                        }
                        tokio::time::sleep(interval).await;
                    }

                    tracing::warn!(%root_id, "workflow did not cancel in time");
                    let err =
                        FlowError::new(ErrorCode::SystemTerminatedError, TIMEOUT_AUTO_TERMINATE);
                    return self
                        .finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                        .await;
                }

                let err = FlowError::new(
                    ErrorCode::UserTerminated,
                    format_terminate_reason(operator, remark),
                );
                self.finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                    .await
            }
            FlowStatus::Failed | FlowStatus::Pending => {
                let err = FlowError::new(
                    ErrorCode::UserTerminated,
                    format_terminate_reason(operator, remark),
                );
                self.finish_flow(&flow, FlowStatus::Terminated, Some(&err))
                    .await
            }
            other => Err(Error::InvalidStateTransition {
                from: other.to_string(),
                to: FlowStatus::Terminated.to_string(),
                reason: "current flow cannot be terminated".into(),
            }),
        }
    }

    /// Human-initiated retry of the current failed flow.
    ///
    /// # Errors
    ///
    /// Returns an invalid-transition error when the current flow is not
    /// FAILED or its retry policy forbids it.
    #[tracing::instrument(skip(self), fields(ticket_id = %ticket_id))]
    pub async fn retry(&self, ticket_id: TicketId) -> Result<()> {
        let flow = self
            .ctx
            .store
            .current_flow(ticket_id)
            .await?
            .ok_or(Error::TicketNotFound { ticket_id })?;

        if !flow.can_retry() {
            return Err(Error::InvalidStateTransition {
                from: flow.status.to_string(),
                to: FlowStatus::Running.to_string(),
                reason: "flow is not retriable".into(),
            });
        }

        self.ctx
            .store
            .update_flow_status(flow.id, FlowStatus::Running, None)
            .await?;
        self.refresh_ticket_status(ticket_id).await?;

        if self.execute_flow(ticket_id, flow.id).await? == FlowStatus::Succeeded {
            self.run_next_flow(ticket_id).await?;
        }
        Ok(())
    }

    /// Ticker entry point: retries every pause gate whose human already
    /// asked to continue but was left waiting on a conflict. Gates whose
    /// conflicts have cleared are opened; the rest stay parked. Returns the
    /// number of gates opened.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    #[tracing::instrument(skip(self))]
    pub async fn recheck_paused_gates(&self) -> Result<usize> {
        let waiting = self
            .ctx
            .store
            .tickets_by_status(TicketStatus::TodoWaiting)
            .await?;

        let mut opened = 0;
        for ticket in waiting {
            let Some(flow) = self.ctx.store.current_flow(ticket.id).await? else {
                continue;
            };
            if flow.flow_type != FlowType::PauseWithLockCheck
                || flow.status != FlowStatus::Running
            {
                continue;
            }

            let pending_continue = self
                .ctx
                .store
                .todos_for_flow(flow.id)
                .await?
                .into_iter()
                .find(|t| t.status.is_open() && t.context.contains_key("continue_requested_by"));
            let Some(todo) = pending_continue else {
                continue;
            };

            let conflicts =
                has_exclusive_operations_pause(self.ctx.ledger.as_ref(), &ticket, &flow).await?;
            if !conflicts.is_empty() {
                continue;
            }

            let done_by = todo
                .context
                .get("continue_requested_by")
                .and_then(|v| v.as_str())
                .unwrap_or("system")
                .to_owned();
            release_pause_records(self.ctx.ledger.as_ref(), &ticket, &flow).await?;

            let mut todo = todo;
            todo.close(
                TodoStatus::DoneSuccess,
                done_by,
                Some("auto-continued after conflicts cleared".to_owned()),
            );
            self.ctx.store.save_todo(&todo).await?;

            self.finish_flow(&flow, FlowStatus::Succeeded, None).await?;
            self.run_next_flow(ticket.id).await?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Returns the termination reason for a terminated ticket, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn get_terminate_reason(&self, ticket_id: TicketId) -> Result<Option<String>> {
        let flows = self.ctx.store.flows_for_ticket(ticket_id).await?;
        let Some(terminated) = flows
            .iter()
            .find(|f| f.status == FlowStatus::Terminated)
        else {
            return Ok(None);
        };

        if terminated.err_code == Some(ErrorCode::SystemTerminatedError) {
            return Ok(Some(TIMEOUT_AUTO_TERMINATE.to_owned()));
        }
        Ok(terminated.err_msg.clone())
    }

    /// Assembles the `GET ticket/{id}` summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the ticket does not exist.
    pub async fn summary(&self, ticket_id: TicketId) -> Result<TicketSummary> {
        let ticket = self.ticket(ticket_id).await?;
        let current = self.ctx.store.current_flow(ticket_id).await?;

        let (operators, helpers) = match &current {
            Some(flow) => {
                let todos = self.ctx.store.todos_for_flow(flow.id).await?;
                let open: Vec<_> = todos.iter().filter(|t| t.status.is_open()).collect();
                (
                    open.iter().flat_map(|t| t.operators.clone()).collect(),
                    open.iter().flat_map(|t| t.helpers.clone()).collect(),
                )
            }
            None => (vec![], vec![]),
        };

        let terminate_reason = if ticket.status == TicketStatus::Terminated {
            self.get_terminate_reason(ticket_id).await?
        } else {
            None
        };

        Ok(TicketSummary {
            ticket_id,
            ticket_type: ticket.ticket_type.to_string(),
            status: ticket.status,
            current_flow: current.as_ref().map(|f| f.alias.clone()),
            current_flow_status: current.as_ref().map(|f| f.status),
            operators,
            helpers,
            cost_time: ticket.cost_time(Utc::now()),
            terminate_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowDescriptor;
    use crate::testing;
    use crate::ticket::TicketType;
    use herd_core::BizId;
    use serde_json::json;

    fn manager() -> (testing::TestStage, FlowManager) {
        let stage = testing::stage_context();
        let manager = FlowManager::new(stage.context());
        (stage, manager)
    }

    async fn seed(
        stage: &testing::TestStage,
        descriptors: &[FlowDescriptor],
        cluster: Option<u64>,
    ) -> Result<Ticket> {
        let mut details = Bag::new();
        if let Some(id) = cluster {
            details.insert("cluster_ids".into(), json!([id]));
        }
        let ticket = Ticket::new(
            TicketType::MysqlMasterSlaveSwitch,
            BizId::new(3),
            "alice",
            "switch",
            details,
        );
        let flows: Vec<Flow> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| Flow::new(ticket.id, u32::try_from(i).unwrap_or(u32::MAX), d))
            .collect();
        stage.store.insert_ticket(&ticket, &flows).await?;
        Ok(ticket)
    }

    #[tokio::test]
    async fn delivery_only_pipeline_succeeds() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[FlowDescriptor::new(FlowType::Delivery, "delivery")],
            None,
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn inner_workflow_suspends_until_callback() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[
                FlowDescriptor::new(FlowType::InnerWorkflow, "switch"),
                FlowDescriptor::new(FlowType::Delivery, "delivery"),
            ],
            Some(125),
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Running);

        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let root_id = flows[0].flow_object_id.clone().expect("root id");

        manager
            .handle_workflow_callback(WorkflowCallback {
                root_id,
                result: CallbackResult::Succeeded,
                transient: false,
                message: None,
                output: Some(json!({"new_master": "10.0.0.2"})),
            })
            .await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Succeeded);

        // Output landed in the flow context.
        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        assert_eq!(
            flows[0].context[FLOW_OUTPUT_KEY]["new_master"],
            "10.0.0.2"
        );

        // No ledger records remain.
        assert_eq!(
            stage
                .ledger
                .records_for_ticket(ticket.id)
                .await?
                .len(),
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_callback_is_ignored() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[FlowDescriptor::new(FlowType::InnerWorkflow, "switch")],
            Some(125),
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;
        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let root_id = flows[0].flow_object_id.clone().expect("root id");

        let cb = WorkflowCallback {
            root_id,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        };
        manager.handle_workflow_callback(cb.clone()).await?;
        manager.handle_workflow_callback(cb).await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn failed_callback_keeps_ledger_record() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[FlowDescriptor::new(FlowType::InnerWorkflow, "switch")],
            Some(125),
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;
        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let root_id = flows[0].flow_object_id.clone().expect("root id");

        manager
            .handle_workflow_callback(WorkflowCallback {
                root_id,
                result: CallbackResult::Failed,
                transient: false,
                message: Some("disk full".into()),
                output: None,
            })
            .await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Failed);

        // FAILED flows keep their records until retry or terminate.
        assert_eq!(
            stage
                .ledger
                .records_for_ticket(ticket.id)
                .await?
                .len(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn manual_retry_after_failure() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[FlowDescriptor::new(FlowType::InnerWorkflow, "switch")],
            Some(125),
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;
        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let root_id = flows[0].flow_object_id.clone().expect("root id");

        manager
            .handle_workflow_callback(WorkflowCallback {
                root_id: root_id.clone(),
                result: CallbackResult::Failed,
                transient: false,
                message: Some("disk full".into()),
                output: None,
            })
            .await?;

        manager.retry(ticket.id).await?;
        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Running);

        manager
            .handle_workflow_callback(WorkflowCallback {
                root_id,
                result: CallbackResult::Succeeded,
                transient: false,
                message: None,
                output: None,
            })
            .await?;
        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn approval_rejection_revokes() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[
                FlowDescriptor::new(FlowType::Approval, "approval"),
                FlowDescriptor::new(FlowType::Delivery, "delivery"),
            ],
            None,
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;
        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::ApproveWaiting);

        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let handle = flows[0].flow_object_id.clone().expect("handle");

        manager
            .handle_approval_callback(ApprovalCallback {
                handle,
                result: ApprovalResult::Rejected,
            })
            .await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Revoked);
        Ok(())
    }

    #[tokio::test]
    async fn user_terminates_human_confirm() -> Result<()> {
        let (stage, manager) = manager();
        stage.inventory.set_biz_dba(BizId::new(3), vec!["alice".into()])?;
        let ticket = seed(
            &stage,
            &[
                FlowDescriptor::new(FlowType::HumanConfirm, "confirm"),
                FlowDescriptor::new(FlowType::Delivery, "delivery"),
            ],
            None,
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;
        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::TodoWaiting);

        manager.terminate(ticket.id, "alice", "abort").await?;

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Terminated);

        let reason = manager.get_terminate_reason(ticket.id).await?;
        assert_eq!(
            reason.as_deref(),
            Some("alice handled (manual terminate, remark: abort)")
        );

        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let todos = stage.store.todos_for_flow(flows[0].id).await?;
        assert_eq!(todos[0].status, TodoStatus::DoneFailed);
        Ok(())
    }

    #[tokio::test]
    async fn skip_mode_matches_auto_execute_law() -> Result<()> {
        // Creating with auto_execute=false then calling run_next_flow is
        // equivalent to auto_execute=true: both land in the same state.
        let mut config = crate::config::EngineConfig::default();
        config.dev_skip_approval_confirm = true;
        let stage = testing::stage_context_with(config);
        let manager = FlowManager::new(stage.context());

        let ticket = seed(
            &stage,
            &[
                FlowDescriptor::new(FlowType::Approval, "approval"),
                FlowDescriptor::new(FlowType::HumanConfirm, "confirm"),
                FlowDescriptor::new(FlowType::Delivery, "delivery"),
            ],
            None,
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;

        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        assert_eq!(flows[0].status, FlowStatus::Skipped);
        assert_eq!(flows[1].status, FlowStatus::Skipped);
        assert_eq!(flows[2].status, FlowStatus::Succeeded);

        let stored = stage.store.get_ticket(ticket.id).await?.expect("ticket");
        assert_eq!(stored.status, TicketStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn at_most_one_running_flow() -> Result<()> {
        let (stage, manager) = manager();
        let ticket = seed(
            &stage,
            &[
                FlowDescriptor::new(FlowType::InnerWorkflow, "first"),
                FlowDescriptor::new(FlowType::InnerWorkflow, "second"),
            ],
            Some(125),
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;

        let flows = stage.store.flows_for_ticket(ticket.id).await?;
        let running = flows
            .iter()
            .filter(|f| f.status == FlowStatus::Running)
            .count();
        assert_eq!(running, 1);
        Ok(())
    }

    #[tokio::test]
    async fn summary_reports_current_flow_and_operators() -> Result<()> {
        let (stage, manager) = manager();
        stage
            .inventory
            .set_biz_dba(BizId::new(3), vec!["dba-a".into()])?;
        let ticket = seed(
            &stage,
            &[FlowDescriptor::new(FlowType::HumanConfirm, "confirm")],
            None,
        )
        .await?;

        manager.run_next_flow(ticket.id).await?;

        let summary = manager.summary(ticket.id).await?;
        assert_eq!(summary.status, TicketStatus::TodoWaiting);
        assert_eq!(summary.current_flow.as_deref(), Some("confirm"));
        assert_eq!(summary.operators, vec!["dba-a".to_owned()]);
        Ok(())
    }
}
