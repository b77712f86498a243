//! In-memory operation ledger.
//!
//! A single mutex over the whole record table makes every operation — in
//! particular the scan-then-insert of [`OperationLedger::begin_all`] —
//! trivially serialisable. Suitable for tests and single-process
//! deployments; a SQL implementation would take row locks on the cluster
//! rows in ascending cluster-id order instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use herd_core::{ClusterId, FlowId, TicketId};

use super::{
    BeginOutcome, ConflictInfo, OperationLedger, OperationRecord, RecordHandle, UnlockSet,
};
use crate::error::{Error, Result};
use crate::exclusion::MatrixHandle;
use crate::ticket::TicketType;
use std::sync::Arc;

/// In-memory ledger over a [`MatrixHandle`] snapshot source.
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<ClusterId, Vec<OperationRecord>>>,
    matrix: Arc<MatrixHandle>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("ledger lock poisoned")
}

impl InMemoryLedger {
    /// Creates an empty ledger consulting the given matrix handle.
    #[must_use]
    pub fn new(matrix: Arc<MatrixHandle>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            matrix,
        }
    }

    /// Total number of live records, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn record_count(&self) -> Result<usize> {
        let records = self.records.lock().map_err(poison_err)?;
        Ok(records.values().map(Vec::len).sum())
    }

    /// Scans one cluster for conflicts while the table lock is held.
    fn scan_conflicts(
        records: &MutexGuard<'_, HashMap<ClusterId, Vec<OperationRecord>>>,
        matrix: &crate::exclusion::ExclusionMatrix,
        cluster_id: ClusterId,
        candidate: TicketType,
        exclude: &[TicketId],
        skip_paused: bool,
    ) -> Vec<ConflictInfo> {
        records
            .get(&cluster_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| !exclude.contains(&r.ticket_id))
                    .filter(|r| !(skip_paused && r.is_paused))
                    .filter(|r| !r.unlock.covers(candidate))
                    .filter(|r| matrix.exclusive(candidate, r.ticket_type))
                    .map(|r| ConflictInfo {
                        cluster_id,
                        ticket_id: r.ticket_id,
                        ticket_type: r.ticket_type,
                        flow_id: r.flow_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert_record(
        records: &mut HashMap<ClusterId, Vec<OperationRecord>>,
        cluster_id: ClusterId,
        flow_id: FlowId,
        ticket_id: TicketId,
        ticket_type: TicketType,
        unlock: UnlockSet,
    ) -> RecordHandle {
        let rows = records.entry(cluster_id).or_default();
        let handle = RecordHandle {
            cluster_id,
            flow_id,
            ticket_id,
        };
        let exists = rows
            .iter()
            .any(|r| r.flow_id == flow_id && r.ticket_id == ticket_id);
        if !exists {
            rows.push(OperationRecord {
                cluster_id,
                flow_id,
                ticket_id,
                ticket_type,
                unlock,
                is_paused: false,
                created_at: Utc::now(),
            });
        }
        handle
    }

    fn with_record<T>(
        &self,
        handle: &RecordHandle,
        f: impl FnOnce(&mut OperationRecord) -> T,
    ) -> Result<Option<T>> {
        let mut records = self.records.lock().map_err(poison_err)?;
        let result = records.get_mut(&handle.cluster_id).and_then(|rows| {
            rows.iter_mut()
                .find(|r| r.flow_id == handle.flow_id && r.ticket_id == handle.ticket_id)
                .map(f)
        });
        drop(records);
        Ok(result)
    }
}

#[async_trait]
impl OperationLedger for InMemoryLedger {
    async fn begin(
        &self,
        cluster_id: ClusterId,
        flow_id: FlowId,
        ticket_id: TicketId,
        ticket_type: TicketType,
        unlock: UnlockSet,
    ) -> Result<RecordHandle> {
        let mut records = self.records.lock().map_err(poison_err)?;
        let handle = Self::insert_record(
            &mut records,
            cluster_id,
            flow_id,
            ticket_id,
            ticket_type,
            unlock,
        );
        drop(records);
        Ok(handle)
    }

    #[tracing::instrument(
        skip(self, cluster_ids, unlock, exclude),
        fields(ticket_id = %ticket_id, ticket_type = %ticket_type, clusters = cluster_ids.len())
    )]
    async fn begin_all(
        &self,
        cluster_ids: &[ClusterId],
        flow_id: FlowId,
        ticket_id: TicketId,
        ticket_type: TicketType,
        unlock: UnlockSet,
        exclude: &[TicketId],
    ) -> Result<BeginOutcome> {
        let matrix = self.matrix.snapshot()?;

        // Deterministic order; a lock-per-row implementation must do the
        // same to stay deadlock-free.
        let mut ordered: Vec<ClusterId> = cluster_ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut records = self.records.lock().map_err(poison_err)?;

        let mut conflicts = Vec::new();
        for cluster_id in &ordered {
            conflicts.extend(Self::scan_conflicts(
                &records, &matrix, *cluster_id, ticket_type, exclude, false,
            ));
        }
        if !conflicts.is_empty() {
            drop(records);
            tracing::debug!(conflicts = conflicts.len(), "begin_all rejected");
            return Ok(BeginOutcome::Conflicted(conflicts));
        }

        let handles = ordered
            .into_iter()
            .map(|cluster_id| {
                Self::insert_record(
                    &mut records,
                    cluster_id,
                    flow_id,
                    ticket_id,
                    ticket_type,
                    unlock.clone(),
                )
            })
            .collect();
        drop(records);
        Ok(BeginOutcome::Started(handles))
    }

    async fn end(&self, handle: &RecordHandle) -> Result<()> {
        let mut records = self.records.lock().map_err(poison_err)?;
        if let Some(rows) = records.get_mut(&handle.cluster_id) {
            rows.retain(|r| !(r.flow_id == handle.flow_id && r.ticket_id == handle.ticket_id));
            if rows.is_empty() {
                records.remove(&handle.cluster_id);
            }
        }
        drop(records);
        Ok(())
    }

    async fn end_all_for_flow(&self, flow_id: FlowId) -> Result<()> {
        let mut records = self.records.lock().map_err(poison_err)?;
        records.retain(|_, rows| {
            rows.retain(|r| r.flow_id != flow_id);
            !rows.is_empty()
        });
        drop(records);
        Ok(())
    }

    async fn mark_paused(&self, handle: &RecordHandle, paused: bool) -> Result<()> {
        self.with_record(handle, |r| r.is_paused = paused)?;
        Ok(())
    }

    async fn conflicts(
        &self,
        cluster_id: ClusterId,
        candidate: TicketType,
        exclude: &[TicketId],
    ) -> Result<Vec<ConflictInfo>> {
        let matrix = self.matrix.snapshot()?;
        let records = self.records.lock().map_err(poison_err)?;
        let conflicts =
            Self::scan_conflicts(&records, &matrix, cluster_id, candidate, exclude, false);
        drop(records);
        Ok(conflicts)
    }

    async fn conflicts_for_pause(&self, handle: &RecordHandle) -> Result<Vec<ConflictInfo>> {
        let candidate = self
            .with_record(handle, |r| r.ticket_type)?
            .ok_or_else(|| Error::storage("pause record vanished"))?;

        let matrix = self.matrix.snapshot()?;
        let records = self.records.lock().map_err(poison_err)?;
        let conflicts = Self::scan_conflicts(
            &records,
            &matrix,
            handle.cluster_id,
            candidate,
            &[handle.ticket_id],
            true,
        );
        drop(records);
        Ok(conflicts)
    }

    async fn extend_unlock(&self, handle: &RecordHandle, tokens: &[String]) -> Result<()> {
        self.with_record(handle, |r| r.unlock.extend_tokens(tokens))?;
        Ok(())
    }

    async fn retract_unlock(&self, handle: &RecordHandle, tokens: &[String]) -> Result<()> {
        self.with_record(handle, |r| r.unlock.retract_tokens(tokens))?;
        Ok(())
    }

    async fn records_for_ticket(&self, ticket_id: TicketId) -> Result<Vec<OperationRecord>> {
        let records = self.records.lock().map_err(poison_err)?;
        Ok(records
            .values()
            .flatten()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn records_for_cluster(&self, cluster_id: ClusterId) -> Result<Vec<OperationRecord>> {
        let records = self.records.lock().map_err(poison_err)?;
        Ok(records.get(&cluster_id).cloned().unwrap_or_default())
    }

    async fn sweep(&self, live_flows: &HashSet<FlowId>) -> Result<usize> {
        let mut records = self.records.lock().map_err(poison_err)?;
        let before: usize = records.values().map(Vec::len).sum();
        records.retain(|_, rows| {
            rows.retain(|r| live_flows.contains(&r.flow_id));
            !rows.is_empty()
        });
        let after: usize = records.values().map(Vec::len).sum();
        drop(records);
        let removed = before - after;
        if removed > 0 {
            tracing::info!(removed, "swept stale ledger records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusion::ExclusionMatrix;

    const MATRIX: &str = "\
,MYSQL_MASTER_SLAVE_SWITCH,MYSQL_HA_FULL_BACKUP,MYSQL_PROXY_SWITCH
MYSQL_HA_FULL_BACKUP,Y,N,N
MYSQL_MASTER_SLAVE_SWITCH,Y,Y,N
MYSQL_PROXY_SWITCH,N,N,N
";

    fn ledger() -> InMemoryLedger {
        let handle = MatrixHandle::new(ExclusionMatrix::parse(MATRIX).unwrap());
        InMemoryLedger::new(Arc::new(handle))
    }

    #[tokio::test]
    async fn begin_is_idempotent() -> Result<()> {
        let ledger = ledger();
        let cluster = ClusterId::new(125);
        let flow = FlowId::generate();
        let ticket = TicketId::generate();

        ledger
            .begin(
                cluster,
                flow,
                ticket,
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;
        ledger
            .begin(
                cluster,
                flow,
                ticket,
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        assert_eq!(ledger.record_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn begin_then_end_restores_prior_state() -> Result<()> {
        let ledger = ledger();
        let handle = ledger
            .begin(
                ClusterId::new(125),
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        assert_eq!(ledger.record_count()?, 1);
        ledger.end(&handle).await?;
        assert_eq!(ledger.record_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_candidate_is_rejected() -> Result<()> {
        let ledger = ledger();
        let cluster = ClusterId::new(125);
        let t1 = TicketId::generate();

        ledger
            .begin(
                cluster,
                FlowId::generate(),
                t1,
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        // Backup conflicts with a running switch.
        let conflicts = ledger
            .conflicts(cluster, TicketType::MysqlHaFullBackup, &[])
            .await?;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].ticket_id, t1);

        // Proxy switch does not conflict with a running switch.
        let conflicts = ledger
            .conflicts(cluster, TicketType::MysqlProxySwitch, &[])
            .await?;
        assert!(conflicts.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unlock_set_admits_candidate() -> Result<()> {
        let ledger = ledger();
        let cluster = ClusterId::new(125);

        let handle = ledger
            .begin(
                cluster,
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::from_tokens(["MYSQL_HA_FULL_BACKUP".to_owned()]),
            )
            .await?;

        let conflicts = ledger
            .conflicts(cluster, TicketType::MysqlHaFullBackup, &[])
            .await?;
        assert!(conflicts.is_empty());

        ledger
            .retract_unlock(&handle, &["MYSQL_HA_FULL_BACKUP".to_owned()])
            .await?;
        let conflicts = ledger
            .conflicts(cluster, TicketType::MysqlHaFullBackup, &[])
            .await?;
        assert_eq!(conflicts.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn begin_all_is_all_or_nothing() -> Result<()> {
        let ledger = ledger();
        let busy = ClusterId::new(125);
        let free = ClusterId::new(126);

        ledger
            .begin(
                busy,
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        let outcome = ledger
            .begin_all(
                &[free, busy],
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlHaFullBackup,
                UnlockSet::new(),
                &[],
            )
            .await?;

        assert!(!outcome.is_started());
        // Nothing inserted on the free cluster either.
        assert!(ledger.records_for_cluster(free).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn begin_all_excludes_own_ticket() -> Result<()> {
        let ledger = ledger();
        let cluster = ClusterId::new(125);
        let ticket = TicketId::generate();

        ledger
            .begin(
                cluster,
                FlowId::generate(),
                ticket,
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        let outcome = ledger
            .begin_all(
                &[cluster],
                FlowId::generate(),
                ticket,
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
                &[ticket],
            )
            .await?;
        assert!(outcome.is_started());
        Ok(())
    }

    #[tokio::test]
    async fn serialisable_under_concurrency() -> Result<()> {
        // §8 invariant 5: of two concurrent conflicting begin_all calls on
        // one cluster, exactly one succeeds.
        let ledger = Arc::new(ledger());
        let cluster = ClusterId::new(125);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .begin_all(
                        &[cluster],
                        FlowId::generate(),
                        TicketId::generate(),
                        TicketType::MysqlMasterSlaveSwitch,
                        UnlockSet::new(),
                        &[],
                    )
                    .await
            }));
        }

        let mut started = 0;
        for handle in handles {
            let outcome = handle.await.map_err(|e| Error::storage(e.to_string()))??;
            if outcome.is_started() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        Ok(())
    }

    #[tokio::test]
    async fn paused_records_do_not_block_each_other() -> Result<()> {
        let ledger = ledger();
        let cluster = ClusterId::new(125);

        let h1 = ledger
            .begin(
                cluster,
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;
        let h2 = ledger
            .begin(
                cluster,
                FlowId::generate(),
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        ledger.mark_paused(&h1, true).await?;
        ledger.mark_paused(&h2, true).await?;

        // Each paused gate ignores the other paused record.
        assert!(ledger.conflicts_for_pause(&h1).await?.is_empty());
        assert!(ledger.conflicts_for_pause(&h2).await?.is_empty());

        // Un-pausing one re-engages it as a blocker for the other.
        ledger.mark_paused(&h2, false).await?;
        assert_eq!(ledger.conflicts_for_pause(&h1).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_dead_flows() -> Result<()> {
        let ledger = ledger();
        let live_flow = FlowId::generate();
        let dead_flow = FlowId::generate();

        ledger
            .begin(
                ClusterId::new(1),
                live_flow,
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;
        ledger
            .begin(
                ClusterId::new(2),
                dead_flow,
                TicketId::generate(),
                TicketType::MysqlMasterSlaveSwitch,
                UnlockSet::new(),
            )
            .await?;

        let mut live = HashSet::new();
        live.insert(live_flow);
        let removed = ledger.sweep(&live).await?;

        assert_eq!(removed, 1);
        assert_eq!(ledger.record_count()?, 1);
        Ok(())
    }
}
