//! In-memory collaborator implementations for testing.
//!
//! Every §-interface has a scriptable fake here so integration tests can wire
//! a whole engine without I/O. None of these are suitable for production.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herd_core::{BizId, ClusterId};

use super::{
    ActuatorDispatcher, ApprovalGateway, ApprovalRequest, BackupRecord, BackupRepository,
    ClusterMeta, ClusterStatus, InventoryRepository, Notifier, ResourceApplyParams,
    ResourceApplyResult, ResourceBroker, ResourceImportParams, ResourceResultCode, SeriesQuery,
    SwitchEvent, SwitchQueueService, TimeSeriesBackend, UnifyQueryResult, WorkflowState,
};
use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

// ============================================================================
// Inventory
// ============================================================================

/// In-memory inventory for tests.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    clusters: RwLock<HashMap<ClusterId, ClusterMeta>>,
    biz_dbas: RwLock<HashMap<BizId, Vec<String>>>,
    platform_dbas: RwLock<Vec<String>>,
}

impl MemoryInventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_cluster(&self, meta: ClusterMeta) -> Result<()> {
        let mut clusters = self.clusters.write().map_err(poison_err)?;
        clusters.insert(meta.id, meta);
        Ok(())
    }

    /// Flips a cluster's reported status.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_cluster_status(&self, id: ClusterId, status: ClusterStatus) -> Result<()> {
        let mut clusters = self.clusters.write().map_err(poison_err)?;
        if let Some(meta) = clusters.get_mut(&id) {
            meta.status = status;
        }
        Ok(())
    }

    /// Sets the DBA set for a business.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_biz_dba(&self, biz_id: BizId, dbas: Vec<String>) -> Result<()> {
        let mut map = self.biz_dbas.write().map_err(poison_err)?;
        map.insert(biz_id, dbas);
        Ok(())
    }

    /// Sets the platform DBA fallback set.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_platform_dba(&self, dbas: Vec<String>) -> Result<()> {
        let mut list = self.platform_dbas.write().map_err(poison_err)?;
        *list = dbas;
        Ok(())
    }
}

#[async_trait]
impl InventoryRepository for MemoryInventory {
    async fn clusters_by_biz(&self, biz_id: BizId) -> Result<Vec<ClusterMeta>> {
        let clusters = self.clusters.read().map_err(poison_err)?;
        Ok(clusters
            .values()
            .filter(|c| c.biz_id == biz_id)
            .cloned()
            .collect())
    }

    async fn cluster(&self, id: ClusterId) -> Result<Option<ClusterMeta>> {
        let clusters = self.clusters.read().map_err(poison_err)?;
        Ok(clusters.get(&id).cloned())
    }

    async fn cluster_by_domain(&self, domain: &str) -> Result<Option<ClusterMeta>> {
        let clusters = self.clusters.read().map_err(poison_err)?;
        Ok(clusters.values().find(|c| c.domain == domain).cloned())
    }

    async fn clusters_by_host(&self, host: &str) -> Result<Vec<ClusterMeta>> {
        let clusters = self.clusters.read().map_err(poison_err)?;
        Ok(clusters
            .values()
            .filter(|c| c.members.iter().any(|m| m.host == host))
            .cloned()
            .collect())
    }

    async fn biz_dba(&self, biz_id: BizId) -> Result<Vec<String>> {
        let map = self.biz_dbas.read().map_err(poison_err)?;
        Ok(map.get(&biz_id).cloned().unwrap_or_default())
    }

    async fn platform_dba(&self) -> Result<Vec<String>> {
        let list = self.platform_dbas.read().map_err(poison_err)?;
        Ok(list.clone())
    }
}

// ============================================================================
// Actuator
// ============================================================================

/// A started workflow recorded by the scripted actuator.
#[derive(Debug, Clone)]
pub struct StartedWorkflow {
    /// Root id the workflow was started under.
    pub root_id: String,
    /// The opaque payload.
    pub payload: serde_json::Value,
}

/// Scriptable actuator for tests.
///
/// Each `root_id` can be given a queue of states to report; the final state
/// in the queue repeats. Unscripted workflows report `Running`.
#[derive(Debug, Default)]
pub struct ScriptedActuator {
    started: Mutex<Vec<StartedWorkflow>>,
    cancelled: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<WorkflowState>>>,
    default_state: Mutex<Option<WorkflowState>>,
}

impl ScriptedActuator {
    /// Creates an actuator that reports `Running` for everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an actuator that reports a fixed state for unscripted roots.
    #[must_use]
    pub fn reporting(state: WorkflowState) -> Self {
        let actuator = Self::default();
        if let Ok(mut default_state) = actuator.default_state.lock() {
            *default_state = Some(state);
        }
        actuator
    }

    /// Scripts the state sequence reported for `root_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn script(&self, root_id: &str, states: Vec<WorkflowState>) -> Result<()> {
        let mut scripts = self.scripts.lock().map_err(poison_err)?;
        scripts.insert(root_id.to_owned(), states.into());
        Ok(())
    }

    /// Returns the workflows started so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn started(&self) -> Result<Vec<StartedWorkflow>> {
        let started = self.started.lock().map_err(poison_err)?;
        Ok(started.clone())
    }

    /// Returns the root ids cancelled so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn cancelled(&self) -> Result<Vec<String>> {
        let cancelled = self.cancelled.lock().map_err(poison_err)?;
        Ok(cancelled.clone())
    }
}

#[async_trait]
impl ActuatorDispatcher for ScriptedActuator {
    async fn start(&self, root_id: &str, payload: serde_json::Value) -> Result<()> {
        let mut started = self.started.lock().map_err(poison_err)?;
        started.push(StartedWorkflow {
            root_id: root_id.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn status(&self, root_id: &str) -> Result<WorkflowState> {
        let mut scripts = self.scripts.lock().map_err(poison_err)?;
        if let Some(queue) = scripts.get_mut(root_id) {
            if queue.len() > 1 {
                return Ok(queue.pop_front().unwrap_or(WorkflowState::Running));
            }
            if let Some(state) = queue.front() {
                return Ok(*state);
            }
        }
        drop(scripts);
        let default_state = self.default_state.lock().map_err(poison_err)?;
        Ok(default_state.unwrap_or(WorkflowState::Running))
    }

    async fn cancel(&self, root_id: &str) -> Result<()> {
        let mut cancelled = self.cancelled.lock().map_err(poison_err)?;
        cancelled.push(root_id.to_owned());
        Ok(())
    }
}

// ============================================================================
// Approval gateway
// ============================================================================

/// Records approval requests and mints sequential handles.
#[derive(Debug, Default)]
pub struct MemoryApprovalGateway {
    requests: Mutex<Vec<(String, ApprovalRequest)>>,
}

impl MemoryApprovalGateway {
    /// Creates an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `(handle, request)` pairs created so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn requests(&self) -> Result<Vec<(String, ApprovalRequest)>> {
        let requests = self.requests.lock().map_err(poison_err)?;
        Ok(requests.clone())
    }
}

#[async_trait]
impl ApprovalGateway for MemoryApprovalGateway {
    async fn create_approval(&self, request: ApprovalRequest) -> Result<String> {
        let mut requests = self.requests.lock().map_err(poison_err)?;
        let handle = format!("approval-{}", requests.len() + 1);
        requests.push((handle.clone(), request));
        Ok(handle)
    }
}

// ============================================================================
// Resource broker
// ============================================================================

/// Scriptable resource broker.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    results: Mutex<VecDeque<ResourceApplyResult>>,
    imports: Mutex<Vec<ResourceImportParams>>,
}

impl MemoryBroker {
    /// Creates a broker with no scripted results (applications fail).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next application result.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn push_result(&self, result: ResourceApplyResult) -> Result<()> {
        let mut results = self.results.lock().map_err(poison_err)?;
        results.push_back(result);
        Ok(())
    }

    /// Returns the host returns received so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn imports(&self) -> Result<Vec<ResourceImportParams>> {
        let imports = self.imports.lock().map_err(poison_err)?;
        Ok(imports.clone())
    }
}

#[async_trait]
impl ResourceBroker for MemoryBroker {
    async fn apply(&self, _params: ResourceApplyParams) -> Result<ResourceApplyResult> {
        let mut results = self.results.lock().map_err(poison_err)?;
        Ok(results.pop_front().unwrap_or(ResourceApplyResult {
            code: ResourceResultCode::ResourceLake,
            hosts: vec![],
            request_id: String::new(),
        }))
    }

    async fn import(&self, params: ResourceImportParams) -> Result<()> {
        let mut imports = self.imports.lock().map_err(poison_err)?;
        imports.push(params);
        Ok(())
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Records every notification sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl RecordingNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `(title, body, channels)` triples sent so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn sent(&self) -> Result<Vec<(String, String, Vec<String>)>> {
        let sent = self.sent.lock().map_err(poison_err)?;
        Ok(sent.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, title: &str, body: &str, channel_ids: &[String]) -> Result<()> {
        let mut sent = self.sent.lock().map_err(poison_err)?;
        sent.push((title.to_owned(), body.to_owned(), channel_ids.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Time-series backend
// ============================================================================

/// Scriptable time-series backend keyed by metric name.
#[derive(Debug, Default)]
pub struct ScriptedTimeSeries {
    by_metric: RwLock<HashMap<String, UnifyQueryResult>>,
}

impl ScriptedTimeSeries {
    /// Creates a backend with no series.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the result for a metric.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn script(&self, metric: &str, result: UnifyQueryResult) -> Result<()> {
        let mut by_metric = self.by_metric.write().map_err(poison_err)?;
        by_metric.insert(metric.to_owned(), result);
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesBackend for ScriptedTimeSeries {
    async fn unify_query(&self, params: SeriesQuery) -> Result<UnifyQueryResult> {
        let by_metric = self.by_metric.read().map_err(poison_err)?;
        let mut result = by_metric.get(&params.metric).cloned().unwrap_or_default();
        if !params.filters.is_empty() {
            result.series.retain(|s| {
                params
                    .filters
                    .iter()
                    .all(|(k, v)| s.dimensions.get(k) == Some(v))
            });
        }
        Ok(result)
    }
}

// ============================================================================
// Backup repository
// ============================================================================

/// In-memory backup records keyed by cluster.
#[derive(Debug, Default)]
pub struct MemoryBackups {
    records: RwLock<BTreeMap<ClusterId, Vec<BackupRecord>>>,
}

impl MemoryBackups {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record for a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn push(&self, cluster_id: ClusterId, record: BackupRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poison_err)?;
        records.entry(cluster_id).or_default().push(record);
        Ok(())
    }
}

#[async_trait]
impl BackupRepository for MemoryBackups {
    async fn records(
        &self,
        cluster_id: ClusterId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackupRecord>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records
            .get(&cluster_id)
            .map(|rs| {
                rs.iter()
                    .filter(|r| r.finished_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// HA switch queue
// ============================================================================

/// In-memory switch queue.
#[derive(Debug, Default)]
pub struct MemorySwitchQueue {
    events: RwLock<Vec<SwitchEvent>>,
}

impl MemorySwitchQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn push(&self, event: SwitchEvent) -> Result<()> {
        let mut events = self.events.write().map_err(poison_err)?;
        events.push(event);
        events.sort_by_key(|e| e.switch_id);
        Ok(())
    }
}

#[async_trait]
impl SwitchQueueService for MemorySwitchQueue {
    async fn fetch_since(&self, cursor: u64, limit: usize) -> Result<Vec<SwitchEvent>> {
        let events = self.events.read().map_err(poison_err)?;
        Ok(events
            .iter()
            .filter(|e| e.switch_id >= cursor)
            .take(limit)
            .cloned()
            .collect())
    }
}
