//! Failover drill: exercise the HA switch machinery end to end.
//!
//! apply resources → build cluster → inject fault (a real `FAILOVER_DRILL`
//! ticket) → poll cluster status until ABNORMAL or timeout → disable →
//! destroy → return resources → report.
//!
//! Every workflow step polls the actuator's workflow tree by root id with a
//! bounded retry/interval loop. A failure at any step records a partial
//! report and aborts subsequent steps; in particular, a switch-await timeout
//! returns **without destroying** — the next sweep cleans up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use herd_core::{BizId, ClusterId, DrillId};

use crate::bag::Bag;
use crate::config::PollConfig;
use crate::error::Result;
use crate::external::{
    ActuatorDispatcher, ClusterStatus, ClusterType, InventoryRepository, ResourceApplyParams,
    ResourceBroker, ResourceImportParams, ResourceResultCode, WorkflowState,
};
use crate::registry::{CreateTicketRequest, TicketService};
use crate::ticket::TicketType;

/// Message recorded when the cluster never reports ABNORMAL.
pub const SWITCH_UNCHANGED_MSG: &str = "cluster status unchanged, dbha may not have switched";

/// One step of the drill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrillStep {
    /// Allocate scratch hosts.
    ApplyResources,
    /// Deploy the drill cluster.
    BuildCluster,
    /// Submit the fault-injection ticket.
    InjectFault,
    /// Wait for the HA daemon to notice and switch.
    AwaitSwitch,
    /// Disable the drill cluster.
    Disable,
    /// Destroy the drill cluster.
    Destroy,
    /// Return the scratch hosts.
    ReturnResources,
}

impl std::fmt::Display for DrillStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplyResources => write!(f, "apply_resources"),
            Self::BuildCluster => write!(f, "build_cluster"),
            Self::InjectFault => write!(f, "inject_fault"),
            Self::AwaitSwitch => write!(f, "await_switch"),
            Self::Disable => write!(f, "disable"),
            Self::Destroy => write!(f, "destroy"),
            Self::ReturnResources => write!(f, "return_resources"),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillStepReport {
    /// The step.
    pub step: DrillStep,
    /// Whether it completed.
    pub ok: bool,
    /// Outcome detail.
    pub message: String,
}

/// The drill's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillReport {
    /// Report id.
    pub id: DrillId,
    /// Cluster family exercised.
    pub cluster_type: ClusterType,
    /// When the drill started.
    pub started_at: DateTime<Utc>,
    /// When the drill finished (possibly partially).
    pub finished_at: DateTime<Utc>,
    /// Whether the HA daemon switched (`switched` / `not_switched`).
    pub dbha_status: String,
    /// Per-step outcomes, in execution order.
    pub steps: Vec<DrillStepReport>,
    /// True when every step completed.
    pub ok: bool,
}

/// Parameters of one drill execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillSpec {
    /// Cluster family to exercise.
    pub cluster_type: ClusterType,
    /// Business owning the drill clusters.
    pub biz_id: BizId,
    /// Machine specification for the scratch hosts.
    pub spec: String,
    /// Domain the built drill cluster registers under.
    pub domain: String,
    /// Target city, if constrained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Drives one failover drill.
pub struct FailoverDrill {
    actuator: Arc<dyn ActuatorDispatcher>,
    broker: Arc<dyn ResourceBroker>,
    inventory: Arc<dyn InventoryRepository>,
    service: Arc<TicketService>,
    poll: PollConfig,
}

impl std::fmt::Debug for FailoverDrill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverDrill").finish_non_exhaustive()
    }
}

enum StepOutcome {
    Ok(String),
    Err(String),
}

impl FailoverDrill {
    /// Creates a drill orchestrator.
    #[must_use]
    pub fn new(
        actuator: Arc<dyn ActuatorDispatcher>,
        broker: Arc<dyn ResourceBroker>,
        inventory: Arc<dyn InventoryRepository>,
        service: Arc<TicketService>,
        poll: PollConfig,
    ) -> Self {
        Self {
            actuator,
            broker,
            inventory,
            service,
            poll,
        }
    }

    /// Starts a workflow and polls its tree until terminal or the retry
    /// budget runs out.
    async fn run_workflow(&self, root_id: &str, payload: serde_json::Value) -> Result<StepOutcome> {
        self.actuator.start(root_id, payload).await?;
        for _ in 0..self.poll.max_retry {
            match self.actuator.status(root_id).await? {
                WorkflowState::Succeeded => {
                    return Ok(StepOutcome::Ok(format!("workflow {root_id} succeeded")));
                }
                WorkflowState::Failed | WorkflowState::Revoked => {
                    return Ok(StepOutcome::Err(format!("workflow {root_id} failed")));
                }
                WorkflowState::Running => {
                    tokio::time::sleep(self.poll.interval()).await;
                }
            }
        }
        Ok(StepOutcome::Err(format!(
            "workflow {root_id} still running after {} probes",
            self.poll.max_retry
        )))
    }

    /// Polls the cluster's reported status until ABNORMAL or the retry
    /// budget runs out.
    async fn await_switch(&self, cluster_id: ClusterId) -> Result<StepOutcome> {
        for _ in 0..self.poll.max_retry {
            let status = self
                .inventory
                .cluster(cluster_id)
                .await?
                .map(|c| c.status);
            if status == Some(ClusterStatus::Abnormal) {
                return Ok(StepOutcome::Ok("dbha switched".to_owned()));
            }
            tokio::time::sleep(self.poll.interval()).await;
        }
        Ok(StepOutcome::Err(SWITCH_UNCHANGED_MSG.to_owned()))
    }

    /// Executes the drill and returns its (possibly partial) report.
    ///
    /// # Errors
    ///
    /// Returns an error only on collaborator/storage failures; drill-level
    /// step failures are captured in the report instead.
    #[tracing::instrument(skip(self, spec), fields(cluster_type = %spec.cluster_type, domain = %spec.domain))]
    pub async fn execute(&self, spec: &DrillSpec) -> Result<DrillReport> {
        let drill_id = DrillId::generate();
        let started_at = Utc::now();
        let mut steps: Vec<DrillStepReport> = Vec::new();
        let mut dbha_status = "not_switched".to_owned();

        macro_rules! step {
            ($step:expr, $outcome:expr) => {
                match $outcome {
                    StepOutcome::Ok(message) => {
                        steps.push(DrillStepReport {
                            step: $step,
                            ok: true,
                            message,
                        });
                    }
                    StepOutcome::Err(message) => {
                        tracing::warn!(step = %$step, %message, "drill step failed");
                        steps.push(DrillStepReport {
                            step: $step,
                            ok: false,
                            message,
                        });
                        return Ok(finish(drill_id, spec, started_at, dbha_status, steps));
                    }
                }
            };
        }

        // 1. Apply resources.
        let apply = self
            .broker
            .apply(ResourceApplyParams {
                biz_id: spec.biz_id,
                spec: spec.spec.clone(),
                count: 2,
                city: spec.city.clone(),
                group: Some("failover-drill".to_owned()),
            })
            .await?;
        let hosts = apply.hosts.clone();
        step!(
            DrillStep::ApplyResources,
            if apply.code == ResourceResultCode::Ok {
                StepOutcome::Ok(format!("{} hosts allocated", hosts.len()))
            } else {
                StepOutcome::Err("resource pool cannot satisfy the drill".to_owned())
            }
        );

        // 2. Build the drill cluster.
        let build_root = format!("drill-build-{drill_id}");
        step!(
            DrillStep::BuildCluster,
            self.run_workflow(
                &build_root,
                json!({
                    "action": "drill_build_cluster",
                    "clusterType": spec.cluster_type,
                    "domain": spec.domain,
                    "hosts": hosts.iter().map(|h| &h.host).collect::<Vec<_>>(),
                }),
            )
            .await?
        );

        let Some(cluster) = self.inventory.cluster_by_domain(&spec.domain).await? else {
            steps.push(DrillStepReport {
                step: DrillStep::BuildCluster,
                ok: false,
                message: format!("built cluster {} not found in inventory", spec.domain),
            });
            return Ok(finish(drill_id, spec, started_at, dbha_status, steps));
        };

        // 3. Inject the fault via a real ticket.
        let mut details = Bag::new();
        details.insert("cluster_ids".into(), json!([cluster.id.as_u64()]));
        let inject = self
            .service
            .create_ticket(CreateTicketRequest {
                ticket_type: TicketType::FailoverDrill,
                bk_biz_id: spec.biz_id,
                details,
                creator: crate::recycle::SYSTEM_CREATOR.to_owned(),
                remark: format!("failover drill {drill_id}"),
                auto_execute: true,
                helpers: vec![],
                notify_channels: vec![],
            })
            .await;
        step!(
            DrillStep::InjectFault,
            match inject {
                Ok(ticket_id) => StepOutcome::Ok(format!("fault ticket {ticket_id} submitted")),
                Err(e) => StepOutcome::Err(format!("fault ticket rejected: {e}")),
            }
        );

        // 4. Wait for the HA daemon to switch.
        step!(DrillStep::AwaitSwitch, self.await_switch(cluster.id).await?);
        dbha_status = "switched".to_owned();

        // 5-6. Disable and destroy the drill cluster.
        step!(
            DrillStep::Disable,
            self.run_workflow(
                &format!("drill-disable-{drill_id}"),
                json!({"action": "drill_disable_cluster", "clusterId": cluster.id}),
            )
            .await?
        );
        step!(
            DrillStep::Destroy,
            self.run_workflow(
                &format!("drill-destroy-{drill_id}"),
                json!({"action": "drill_destroy_cluster", "clusterId": cluster.id}),
            )
            .await?
        );

        // 7. Return the scratch hosts.
        self.broker
            .import(ResourceImportParams {
                biz_id: spec.biz_id,
                hosts,
                request_id: Some(apply.request_id),
            })
            .await?;
        steps.push(DrillStepReport {
            step: DrillStep::ReturnResources,
            ok: true,
            message: "hosts returned".to_owned(),
        });

        Ok(finish(drill_id, spec, started_at, dbha_status, steps))
    }
}

fn finish(
    id: DrillId,
    spec: &DrillSpec,
    started_at: DateTime<Utc>,
    dbha_status: String,
    steps: Vec<DrillStepReport>,
) -> DrillReport {
    let ok = steps.iter().all(|s| s.ok) && steps.len() == 7;
    DrillReport {
        id,
        cluster_type: spec.cluster_type,
        started_at,
        finished_at: Utc::now(),
        dbha_status,
        steps,
        ok,
    }
}
