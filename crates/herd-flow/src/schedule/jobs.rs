//! The maintenance jobs the catalog ships with.
//!
//! Each job is an ordinary external submitter: tickets go through
//! `create_ticket`, with no ledger shortcuts.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use herd_core::BizId;

use super::selection::{select_clusters, ExerciseCandidate, RecentCounts};
use super::{InstanceLog, Job};
use crate::bag::Bag;
use crate::drill::{
    audit_health, sweep_backup_audit, BackupAuditConfig, DrillSpec, FailoverDrill, NodeHealth,
};
use crate::error::{Error, Result};
use crate::external::{BackupRepository, InventoryRepository, Notifier, TimeSeriesBackend};
use crate::registry::{CreateTicketRequest, TicketService};
use crate::ticket::TicketType;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("stats lock poisoned")
}

/// Source of exercise history for the rollback job.
#[async_trait]
pub trait ExerciseStats: Send + Sync {
    /// Returns the selectable clusters with their exercise history.
    async fn candidates(&self) -> Result<Vec<ExerciseCandidate>>;

    /// Returns the per-type exercise counts within `window`.
    async fn recent_counts(&self, window: Duration) -> Result<RecentCounts>;

    /// Records a submitted exercise for a cluster.
    async fn record_submission(&self, candidate: &ExerciseCandidate) -> Result<()>;
}

/// In-memory exercise history for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryExerciseStats {
    candidates: Mutex<Vec<ExerciseCandidate>>,
    recent: Mutex<RecentCounts>,
    submissions: Mutex<Vec<ExerciseCandidate>>,
}

impl MemoryExerciseStats {
    /// Creates empty stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the candidate set.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_candidates(&self, candidates: Vec<ExerciseCandidate>) -> Result<()> {
        let mut slot = self.candidates.lock().map_err(poison_err)?;
        *slot = candidates;
        Ok(())
    }

    /// Sets the recent counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_recent(&self, recent: RecentCounts) -> Result<()> {
        let mut slot = self.recent.lock().map_err(poison_err)?;
        *slot = recent;
        Ok(())
    }

    /// Returns the submissions recorded so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn submissions(&self) -> Result<Vec<ExerciseCandidate>> {
        let submissions = self.submissions.lock().map_err(poison_err)?;
        Ok(submissions.clone())
    }
}

#[async_trait]
impl ExerciseStats for MemoryExerciseStats {
    async fn candidates(&self) -> Result<Vec<ExerciseCandidate>> {
        let candidates = self.candidates.lock().map_err(poison_err)?;
        Ok(candidates.clone())
    }

    async fn recent_counts(&self, _window: Duration) -> Result<RecentCounts> {
        let recent = self.recent.lock().map_err(poison_err)?;
        Ok(*recent)
    }

    async fn record_submission(&self, candidate: &ExerciseCandidate) -> Result<()> {
        let mut submissions = self.submissions.lock().map_err(poison_err)?;
        submissions.push(candidate.clone());
        Ok(())
    }
}

/// Routine rollback exercise: pick clusters by weighted selection and submit
/// one `MYSQL_ROLLBACK_CLUSTER` ticket per pick.
pub struct RollbackExerciseJob {
    service: Arc<TicketService>,
    stats: Arc<dyn ExerciseStats>,
    /// Clusters to exercise per fire.
    target: usize,
    /// Scratch host specification for the rollback clusters.
    scratch_spec: String,
    backup_lookback: Duration,
    rng_seed: Option<u64>,
}

impl RollbackExerciseJob {
    /// Creates the job.
    #[must_use]
    pub fn new(
        service: Arc<TicketService>,
        stats: Arc<dyn ExerciseStats>,
        target: usize,
        scratch_spec: impl Into<String>,
        backup_lookback: Duration,
    ) -> Self {
        Self {
            service,
            stats,
            target,
            scratch_spec: scratch_spec.into(),
            backup_lookback,
            rng_seed: None,
        }
    }

    /// Fixes the sampler seed (tests).
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

#[async_trait]
impl Job for RollbackExerciseJob {
    async fn run(&self, log: &mut InstanceLog) -> Result<()> {
        let now = Utc::now();
        let recent = self.stats.recent_counts(Duration::hours(2)).await?;
        let candidates = self.stats.candidates().await?;

        let mut rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let picked = select_clusters(
            &candidates,
            self.target,
            recent,
            now,
            self.backup_lookback,
            &mut rng,
        );
        log.log(format!(
            "{} candidates, {} selected (target {})",
            candidates.len(),
            picked.len(),
            self.target
        ));

        for candidate in picked {
            let mut details = Bag::new();
            details.insert("cluster_ids".into(), json!([candidate.cluster_id.as_u64()]));
            details.insert("spec".into(), json!(self.scratch_spec));
            details.insert("count".into(), json!(2));

            match self
                .service
                .create_ticket(CreateTicketRequest {
                    ticket_type: TicketType::MysqlRollbackCluster,
                    bk_biz_id: candidate.biz_id,
                    details,
                    creator: crate::recycle::SYSTEM_CREATOR.to_owned(),
                    remark: "routine rollback exercise".to_owned(),
                    auto_execute: true,
                    helpers: vec![],
                    notify_channels: vec![],
                })
                .await
            {
                Ok(ticket_id) => {
                    log.log(format!(
                        "cluster {}: ticket {ticket_id}",
                        candidate.cluster_id
                    ));
                    self.stats.record_submission(&candidate).await?;
                }
                Err(e) => {
                    log.log(format!("cluster {}: rejected: {e}", candidate.cluster_id));
                }
            }
        }
        Ok(())
    }
}

/// Backup-audit sweep over the configured businesses.
pub struct BackupAuditJob {
    inventory: Arc<dyn InventoryRepository>,
    backups: Arc<dyn BackupRepository>,
    notifier: Arc<dyn Notifier>,
    biz_ids: Vec<BizId>,
    notify_channels: Vec<String>,
    config: BackupAuditConfig,
}

impl BackupAuditJob {
    /// Creates the job.
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryRepository>,
        backups: Arc<dyn BackupRepository>,
        notifier: Arc<dyn Notifier>,
        biz_ids: Vec<BizId>,
        notify_channels: Vec<String>,
        config: BackupAuditConfig,
    ) -> Self {
        Self {
            inventory,
            backups,
            notifier,
            biz_ids,
            notify_channels,
            config,
        }
    }
}

#[async_trait]
impl Job for BackupAuditJob {
    async fn run(&self, log: &mut InstanceLog) -> Result<()> {
        let now = Utc::now();
        let mut failures = 0usize;

        for biz_id in &self.biz_ids {
            let rows = sweep_backup_audit(
                self.inventory.as_ref(),
                self.backups.as_ref(),
                *biz_id,
                &self.config,
                now,
            )
            .await?;
            for row in rows {
                if !row.ok {
                    failures += 1;
                }
                log.log(format!(
                    "{} shard {:?}: {}",
                    row.domain, row.shard_id, row.message
                ));
            }
        }

        if failures > 0 && !self.notify_channels.is_empty() {
            self.notifier
                .send(
                    "backup audit failures",
                    &format!("{failures} shard(s) failed the backup audit"),
                    &self.notify_channels,
                )
                .await?;
        }
        Ok(())
    }
}

/// Health metric audit over the configured businesses.
pub struct HealthAuditJob {
    inventory: Arc<dyn InventoryRepository>,
    tsdb: Arc<dyn TimeSeriesBackend>,
    biz_ids: Vec<BizId>,
    window: Duration,
}

impl HealthAuditJob {
    /// Creates the job.
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryRepository>,
        tsdb: Arc<dyn TimeSeriesBackend>,
        biz_ids: Vec<BizId>,
        window: Duration,
    ) -> Self {
        Self {
            inventory,
            tsdb,
            biz_ids,
            window,
        }
    }
}

#[async_trait]
impl Job for HealthAuditJob {
    async fn run(&self, log: &mut InstanceLog) -> Result<()> {
        let now = Utc::now();
        for biz_id in &self.biz_ids {
            let rows = audit_health(
                self.inventory.as_ref(),
                self.tsdb.as_ref(),
                *biz_id,
                self.window,
                now,
            )
            .await?;
            let bad = rows
                .iter()
                .filter(|r| r.health != NodeHealth::Ok)
                .count();
            log.log(format!(
                "biz {biz_id}: {} nodes audited, {bad} unhealthy",
                rows.len()
            ));
            for row in rows.iter().filter(|r| r.health != NodeHealth::Ok) {
                log.log(format!(
                    "cluster {} {}:{} {:?}",
                    row.cluster_id, row.host, row.port, row.health
                ));
            }
        }
        Ok(())
    }
}

/// Ticker retrying blocked pause gates whose conflicts may have cleared
/// since the human asked to continue.
pub struct PauseGateRecheckJob {
    manager: Arc<crate::manager::FlowManager>,
}

impl PauseGateRecheckJob {
    /// Creates the job.
    #[must_use]
    pub fn new(manager: Arc<crate::manager::FlowManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Job for PauseGateRecheckJob {
    async fn run(&self, log: &mut InstanceLog) -> Result<()> {
        let opened = self.manager.recheck_paused_gates().await?;
        log.log(format!("{opened} pause gate(s) opened"));
        Ok(())
    }
}

/// Periodic failover drills.
pub struct FailoverDrillJob {
    drill: Arc<FailoverDrill>,
    specs: Vec<DrillSpec>,
}

impl FailoverDrillJob {
    /// Creates the job.
    #[must_use]
    pub fn new(drill: Arc<FailoverDrill>, specs: Vec<DrillSpec>) -> Self {
        Self { drill, specs }
    }
}

#[async_trait]
impl Job for FailoverDrillJob {
    async fn run(&self, log: &mut InstanceLog) -> Result<()> {
        for spec in &self.specs {
            let report = self.drill.execute(spec).await?;
            log.log(format!(
                "drill {} on {}: ok={} dbha_status={}",
                report.id, spec.domain, report.ok, report.dbha_status
            ));
            for step in &report.steps {
                log.log(format!("  {}: {}", step.step, step.message));
            }
        }
        Ok(())
    }
}
