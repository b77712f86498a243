//! External collaborator interfaces.
//!
//! The core never performs database or host-level work itself; it sequences
//! it through these seams. Every trait here is implemented in-memory in
//! [`memory`] for tests, and by real adapters (HTTP, RPC) outside this crate.
//!
//! ## Design Principles
//!
//! - **Injected collaborators**: no global handles; everything is passed as
//!   an `Arc<dyn Trait>`.
//! - **Opaque payloads**: the actuator payload is an opaque JSON value built
//!   by out-of-scope per-action builders.
//! - **Read-only inventory**: the core never writes cluster metadata.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId};

use crate::error::Result;

// ============================================================================
// Inventory
// ============================================================================

/// Cluster deployment families known to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Relational primary/secondary pair.
    TendbHa,
    /// Sharded relational cluster.
    TendbCluster,
    /// Cache cluster.
    RedisCluster,
    /// Document-store cluster.
    MongoCluster,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TendbHa => write!(f, "tendbha"),
            Self::TendbCluster => write!(f, "tendbcluster"),
            Self::RedisCluster => write!(f, "rediscluster"),
            Self::MongoCluster => write!(f, "mongocluster"),
        }
    }
}

/// Reported cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// Operating normally.
    Normal,
    /// A member has failed or a switch is in progress.
    Abnormal,
}

/// Member roles within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    /// Front-end proxy.
    Proxy,
    /// Relational or cache storage node.
    Storage,
    /// Document-store router.
    Mongos,
    /// Document-store storage node.
    MongoStorage,
}

/// One cluster member instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    /// Host address.
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Member role.
    pub role: InstanceRole,
}

/// One shard of a sharded cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMeta {
    /// Shard index within the cluster.
    pub shard_id: u32,
    /// Shard name.
    pub name: String,
}

/// Cluster metadata returned by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMeta {
    /// Inventory-assigned cluster id.
    pub id: ClusterId,
    /// Owning business.
    pub biz_id: BizId,
    /// Deployment family.
    pub cluster_type: ClusterType,
    /// Primary access domain.
    pub domain: String,
    /// Reported health.
    pub status: ClusterStatus,
    /// Cloud region id.
    pub cloud_id: u64,
    /// Free-form tags (`backup`, `temporary`, ...).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Shards, for sharded families.
    #[serde(default)]
    pub shards: Vec<ShardMeta>,
    /// Member instances.
    #[serde(default)]
    pub members: Vec<InstanceMeta>,
    /// When the cluster was deployed.
    pub created_at: DateTime<Utc>,
}

/// Read-only access to cluster/host metadata.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// Returns all clusters owned by a business.
    async fn clusters_by_biz(&self, biz_id: BizId) -> Result<Vec<ClusterMeta>>;

    /// Returns a cluster by id.
    async fn cluster(&self, id: ClusterId) -> Result<Option<ClusterMeta>>;

    /// Returns a cluster by its primary access domain.
    async fn cluster_by_domain(&self, domain: &str) -> Result<Option<ClusterMeta>>;

    /// Returns all clusters a host belongs to.
    async fn clusters_by_host(&self, host: &str) -> Result<Vec<ClusterMeta>>;

    /// Returns the business's DBA operator set.
    async fn biz_dba(&self, biz_id: BizId) -> Result<Vec<String>>;

    /// Returns the platform DBA fallback set.
    async fn platform_dba(&self) -> Result<Vec<String>>;
}

// ============================================================================
// Actuator
// ============================================================================

/// Status of an out-of-process workflow tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// The workflow is executing.
    Running,
    /// The workflow finished successfully.
    Succeeded,
    /// The workflow failed terminally.
    Failed,
    /// The workflow was revoked/cancelled.
    Revoked,
}

impl WorkflowState {
    /// Returns true if the workflow will make no further progress.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Revoked)
    }
}

/// Starts, monitors, and cancels host-level workflow executions.
#[async_trait]
pub trait ActuatorDispatcher: Send + Sync {
    /// Starts a workflow under `root_id` with an opaque payload.
    async fn start(&self, root_id: &str, payload: serde_json::Value) -> Result<()>;

    /// Returns the workflow tree status for `root_id`.
    async fn status(&self, root_id: &str) -> Result<WorkflowState>;

    /// Requests cancellation of the workflow under `root_id`.
    async fn cancel(&self, root_id: &str) -> Result<()>;
}

// ============================================================================
// Approval gateway
// ============================================================================

/// The approval request submitted for a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Ticket under approval.
    pub ticket_id: String,
    /// Ticket type token.
    pub ticket_type: String,
    /// Requesting business.
    pub biz_id: BizId,
    /// Submitter.
    pub creator: String,
    /// One-line summary shown to approvers.
    pub summary: String,
}

/// External approval service.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Creates an approval instance; returns its opaque handle.
    ///
    /// The gateway later invokes the approval callback with the handle and
    /// the result.
    async fn create_approval(&self, request: ApprovalRequest) -> Result<String>;
}

// ============================================================================
// Resource broker
// ============================================================================

/// Result codes shared with the resource broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceResultCode {
    /// Allocation satisfied.
    Ok,
    /// The pool cannot satisfy the request.
    ResourceLake,
    /// Any other broker-side failure.
    Failed,
}

/// One allocated host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Host address.
    pub host: String,
    /// Cloud region id.
    pub cloud_id: u64,
    /// Machine specification label.
    pub spec: String,
}

/// Parameters for a resource application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceApplyParams {
    /// Requesting business.
    pub biz_id: BizId,
    /// Machine specification label.
    pub spec: String,
    /// Number of hosts wanted.
    pub count: u32,
    /// Target city / zone, if constrained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Group label for batch applications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// The broker's answer to an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceApplyResult {
    /// Outcome code.
    pub code: ResourceResultCode,
    /// Allocated hosts (empty unless `code == Ok`).
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    /// Broker-side request id, for returns.
    pub request_id: String,
}

/// Parameters for returning hosts to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceImportParams {
    /// Returning business.
    pub biz_id: BizId,
    /// Hosts going back to the pool.
    pub hosts: Vec<HostSpec>,
    /// The original allocation's request id, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// The resource-pool allocator.
#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Applies for hosts.
    async fn apply(&self, params: ResourceApplyParams) -> Result<ResourceApplyResult>;

    /// Returns hosts to the pool.
    async fn import(&self, params: ResourceImportParams) -> Result<()>;
}

// ============================================================================
// Notifier
// ============================================================================

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a message to the given channels.
    async fn send(&self, title: &str, body: &str, channel_ids: &[String]) -> Result<()>;
}

// ============================================================================
// Time-series backend
// ============================================================================

/// A metric query against the time-series backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesQuery {
    /// Metric name (e.g. `mysql_up`).
    pub metric: String,
    /// Dimension filters, all must match.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Query window start.
    pub start: DateTime<Utc>,
    /// Query window end.
    pub end: DateTime<Utc>,
}

/// One series returned by a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    /// Series dimensions (`instance`, `instance_role`, ...).
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    /// `(value, timestamp_ms)` pairs.
    #[serde(default)]
    pub datapoints: Vec<(f64, i64)>,
}

impl Series {
    /// Returns the most recent datapoint value, if any.
    #[must_use]
    pub fn latest(&self) -> Option<f64> {
        self.datapoints
            .iter()
            .max_by_key(|(_, ts)| *ts)
            .map(|(v, _)| *v)
    }
}

/// Result shape of a unified query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifyQueryResult {
    /// Matching series.
    #[serde(default)]
    pub series: Vec<Series>,
}

/// Monitoring time-series backend.
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    /// Runs a unified metric query.
    async fn unify_query(&self, params: SeriesQuery) -> Result<UnifyQueryResult>;
}

// ============================================================================
// Backup repository
// ============================================================================

/// Kind of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupKind {
    /// Full backup.
    Full,
    /// Incremental backup.
    Incremental,
}

/// One backup record for a cluster shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Shard index (0 for unsharded clusters).
    pub shard_id: u32,
    /// Record kind.
    pub kind: BackupKind,
    /// When the backup started.
    pub started_at: DateTime<Utc>,
    /// When the backup finished.
    pub finished_at: DateTime<Utc>,
    /// Monotonic sequence within the shard's incremental chain.
    pub sequence: u64,
}

/// Read-only access to backup records.
#[async_trait]
pub trait BackupRepository: Send + Sync {
    /// Returns backup records for a cluster since `since`, all shards.
    async fn records(&self, cluster_id: ClusterId, since: DateTime<Utc>)
        -> Result<Vec<BackupRecord>>;
}

// ============================================================================
// HA switch queue
// ============================================================================

/// One HA switch event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchEvent {
    /// Monotonically increasing switch id.
    pub switch_id: u64,
    /// Faulty host.
    pub host: String,
    /// Switched port.
    pub port: u16,
    /// Daemon-reported status token (`success`, `doing`, `failed`, ...).
    pub status: String,
    /// When the daemon recorded the event.
    pub recorded_at: DateTime<Utc>,
}

/// Cursor-based enumeration of the HA daemon's switch queue.
#[async_trait]
pub trait SwitchQueueService: Send + Sync {
    /// Returns up to `limit` events with `switch_id >= cursor`, ascending.
    async fn fetch_since(&self, cursor: u64, limit: usize) -> Result<Vec<SwitchEvent>>;
}
