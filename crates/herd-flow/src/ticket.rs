//! Ticket model and status derivation.
//!
//! A ticket is the user-facing unit of change work against the fleet. Its
//! status is never stored authoritatively: it is a deterministic function of
//! the statuses of its flows, recomputed whenever any flow changes state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId, TicketId};

use crate::bag::{self, Bag};
use crate::flow::{Flow, FlowStatus, FlowType};

/// Domain actions the control plane knows how to sequence.
///
/// The production catalog is far larger; this enum carries the types the core
/// itself registers builders for, plus the tokens referenced by the exclusion
/// matrix and the unlock-set vocabulary. Matrix and unlock-set lookups go
/// through [`TicketType::as_token`], so unknown tokens from the tabular
/// source degrade to the safe default (conflict).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketType {
    /// Deploy a relational primary/secondary pair.
    MysqlHaApply,
    /// Tear down a relational HA cluster.
    MysqlHaDestroy,
    /// Disable a relational HA cluster.
    MysqlHaDisable,
    /// Enable a relational HA cluster.
    MysqlHaEnable,
    /// Take a full backup of a relational HA cluster.
    MysqlHaFullBackup,
    /// Planned primary/secondary switch.
    MysqlMasterSlaveSwitch,
    /// Unplanned primary failover.
    MysqlMasterFailOver,
    /// Replace a proxy in front of a relational cluster.
    MysqlProxySwitch,
    /// Add a proxy to a relational cluster.
    MysqlProxyAdd,
    /// Add a secondary to a relational cluster.
    MysqlAddSlave,
    /// Rebuild a broken secondary.
    MysqlRestoreSlave,
    /// Migrate a relational cluster onto new hosts.
    MysqlMigrateCluster,
    /// Roll a cluster back to a point in time on scratch hosts.
    MysqlRollbackCluster,
    /// Data consistency checksum run.
    MysqlChecksum,
    /// Deploy a sharded relational cluster.
    TendbClusterApply,
    /// Tear down a sharded relational cluster.
    TendbClusterDestroy,
    /// Full backup of a sharded relational cluster.
    TendbClusterFullBackup,
    /// Planned switch within a sharded relational cluster.
    TendbClusterMasterSlaveSwitch,
    /// Deploy a cache cluster.
    RedisClusterApply,
    /// Tear down a cache cluster.
    RedisClusterDestroy,
    /// Automatic fault repair for a cache cluster.
    RedisClusterAutofix,
    /// Deploy a document-store cluster.
    MongodbClusterApply,
    /// Automatic fault repair for a document-store cluster.
    MongodbAutofix,
    /// Return allocated hosts to the resource pool.
    ResourceReturn,
    /// Inject a failure for a failover drill.
    FailoverDrill,
}

impl TicketType {
    /// Returns the wire token for this type (`MYSQL_HA_APPLY`, ...).
    #[must_use]
    pub const fn as_token(&self) -> &'static str {
        match self {
            Self::MysqlHaApply => "MYSQL_HA_APPLY",
            Self::MysqlHaDestroy => "MYSQL_HA_DESTROY",
            Self::MysqlHaDisable => "MYSQL_HA_DISABLE",
            Self::MysqlHaEnable => "MYSQL_HA_ENABLE",
            Self::MysqlHaFullBackup => "MYSQL_HA_FULL_BACKUP",
            Self::MysqlMasterSlaveSwitch => "MYSQL_MASTER_SLAVE_SWITCH",
            Self::MysqlMasterFailOver => "MYSQL_MASTER_FAIL_OVER",
            Self::MysqlProxySwitch => "MYSQL_PROXY_SWITCH",
            Self::MysqlProxyAdd => "MYSQL_PROXY_ADD",
            Self::MysqlAddSlave => "MYSQL_ADD_SLAVE",
            Self::MysqlRestoreSlave => "MYSQL_RESTORE_SLAVE",
            Self::MysqlMigrateCluster => "MYSQL_MIGRATE_CLUSTER",
            Self::MysqlRollbackCluster => "MYSQL_ROLLBACK_CLUSTER",
            Self::MysqlChecksum => "MYSQL_CHECKSUM",
            Self::TendbClusterApply => "TENDBCLUSTER_APPLY",
            Self::TendbClusterDestroy => "TENDBCLUSTER_DESTROY",
            Self::TendbClusterFullBackup => "TENDBCLUSTER_FULL_BACKUP",
            Self::TendbClusterMasterSlaveSwitch => "TENDBCLUSTER_MASTER_SLAVE_SWITCH",
            Self::RedisClusterApply => "REDIS_CLUSTER_APPLY",
            Self::RedisClusterDestroy => "REDIS_CLUSTER_DESTROY",
            Self::RedisClusterAutofix => "REDIS_CLUSTER_AUTOFIX",
            Self::MongodbClusterApply => "MONGODB_CLUSTER_APPLY",
            Self::MongodbAutofix => "MONGODB_AUTOFIX",
            Self::ResourceReturn => "RESOURCE_RETURN",
            Self::FailoverDrill => "FAILOVER_DRILL",
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// Ticket status, derived from flow statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Created, no flow has started.
    Pending,
    /// A flow is executing.
    Running,
    /// All flows succeeded or were skipped.
    Succeeded,
    /// A flow failed.
    Failed,
    /// A flow was terminated (by a human or by the core).
    Terminated,
    /// An approval was rejected.
    Revoked,
    /// The current flow awaits an external approval.
    ApproveWaiting,
    /// The current flow awaits human confirmation.
    TodoWaiting,
}

impl TicketStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Terminated | Self::Revoked
        )
    }

    /// Derives the ticket status from its flows.
    ///
    /// Deterministic and idempotent: recomputing from the same flows yields
    /// the same value. Tie-break: TERMINATED beats FAILED and REVOKED, which
    /// both beat a plain FAILED derivation, because an explicit termination
    /// is the stronger statement about why the ticket stopped.
    #[must_use]
    pub fn derive(flows: &[Flow]) -> Self {
        if let Some(running) = flows.iter().find(|f| f.status == FlowStatus::Running) {
            return match running.flow_type {
                FlowType::Approval => Self::ApproveWaiting,
                FlowType::HumanConfirm | FlowType::PauseWithLockCheck => Self::TodoWaiting,
                _ => Self::Running,
            };
        }

        if flows.iter().any(|f| f.status == FlowStatus::Terminated) {
            return Self::Terminated;
        }
        if flows.iter().any(|f| f.status == FlowStatus::Revoked) {
            return Self::Revoked;
        }
        if flows.iter().any(|f| f.status == FlowStatus::Failed) {
            return Self::Failed;
        }

        let all_done = flows
            .iter()
            .all(|f| matches!(f.status, FlowStatus::Succeeded | FlowStatus::Skipped));
        if all_done && !flows.is_empty() {
            return Self::Succeeded;
        }

        if flows.iter().any(|f| f.status != FlowStatus::Pending) {
            // Between stages: something finished, the next has not started.
            return Self::Running;
        }

        Self::Pending
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Terminated => write!(f, "TERMINATED"),
            Self::Revoked => write!(f, "REVOKED"),
            Self::ApproveWaiting => write!(f, "APPROVE_WAITING"),
            Self::TodoWaiting => write!(f, "TODO_WAITING"),
        }
    }
}

/// Notification and helper settings attached to a ticket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketConfig {
    /// Chat channels to notify on state changes.
    pub notify_channels: Vec<String>,
    /// Additional humans allowed to act on the ticket's todos.
    pub helpers: Vec<String>,
    /// Ad-hoc context carried alongside the ticket.
    #[serde(flatten)]
    pub extra: Bag,
}

/// A user (or system) change request against the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Unique ticket identifier.
    pub id: TicketId,
    /// Domain action being requested.
    pub ticket_type: TicketType,
    /// Requesting business.
    pub biz_id: BizId,
    /// Who submitted the request.
    pub creator: String,
    /// Free-form remark from the submitter.
    pub remark: String,
    /// Derived status.
    pub status: TicketStatus,
    /// Type-specific detail bag, schema enforced by the builder.
    pub details: Bag,
    /// Notification settings, helpers, ad-hoc context.
    pub config: TicketConfig,
    /// When the ticket was created.
    pub created_at: DateTime<Utc>,
    /// When the ticket last changed.
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Creates a new pending ticket.
    #[must_use]
    pub fn new(
        ticket_type: TicketType,
        biz_id: BizId,
        creator: impl Into<String>,
        remark: impl Into<String>,
        details: Bag,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TicketId::generate(),
            ticket_type,
            biz_id,
            creator: creator.into(),
            remark: remark.into(),
            status: TicketStatus::Pending,
            details,
            config: TicketConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the clusters this ticket touches.
    ///
    /// By convention the builder's patcher writes the resolved cluster ids
    /// into `details.cluster_ids`. Apply-style tickets that create clusters
    /// have none until their inner workflow reports back.
    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.details
            .get("cluster_ids")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(serde_json::Value::as_u64)
                    .map(ClusterId::new)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the unlock-set tokens this ticket declares for its ledger
    /// records, from `details.unlock_ticket_types`.
    #[must_use]
    pub fn unlock_ticket_types(&self) -> BTreeSet<String> {
        self.details
            .get("unlock_ticket_types")
            .and_then(|v| v.as_array())
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the elapsed wall-clock time since creation, in seconds.
    #[must_use]
    pub fn cost_time(&self, now: DateTime<Utc>) -> i64 {
        let until = if self.status.is_terminal() {
            self.updated_at
        } else {
            now
        };
        (until - self.created_at).num_seconds().max(0)
    }

    /// Append-merges a patch into the detail bag.
    pub fn merge_details(&mut self, patch: &Bag) {
        bag::merge(&mut self.details, patch);
        self.updated_at = Utc::now();
    }
}
