//! Backup-audit sweep for document-store clusters.
//!
//! For each cluster old enough to have a backup history, every shard must
//! show a FULL backup that completed within the duration bound and a
//! contiguous incremental chain of at least the configured length. Clusters
//! tagged `backup=no|false` or `temporary=true` are skipped with a report
//! row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::external::{BackupKind, BackupRecord, BackupRepository, ClusterType, InventoryRepository};

/// Sweep thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BackupAuditConfig {
    /// Minimum cluster age before auditing.
    pub min_age: Duration,
    /// Look-back window for backup records.
    pub lookback: Duration,
    /// Maximum acceptable FULL backup duration.
    pub max_full_duration: Duration,
    /// Minimum contiguous incremental chain length.
    pub min_incremental_chain: usize,
}

impl BackupAuditConfig {
    /// Derives the thresholds from the engine config.
    #[must_use]
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            min_age: Duration::hours(i64::from(config.backup_audit_min_age_hours)),
            lookback: Duration::hours(i64::from(config.backup_lookback_hours)),
            max_full_duration: Duration::hours(i64::from(config.backup_max_full_duration_hours)),
            min_incremental_chain: config.backup_min_incremental_chain as usize,
        }
    }
}

/// One sweep report row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRow {
    /// Audited cluster.
    pub cluster_id: ClusterId,
    /// Its domain.
    pub domain: String,
    /// The shard, for per-shard failures; `None` for cluster-level rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<u32>,
    /// Whether the row reports a pass.
    pub ok: bool,
    /// Detail.
    pub message: String,
}

fn shard_full_ok(records: &[&BackupRecord], max_full_duration: Duration) -> Option<String> {
    let fulls: Vec<_> = records
        .iter()
        .filter(|r| r.kind == BackupKind::Full)
        .collect();
    if fulls.is_empty() {
        return Some("no FULL backup within window".to_owned());
    }
    if fulls
        .iter()
        .all(|r| r.finished_at - r.started_at > max_full_duration)
    {
        return Some(format!(
            "FULL backup exceeded {}h",
            max_full_duration.num_hours()
        ));
    }
    None
}

fn shard_chain_ok(records: &[&BackupRecord], min_chain: usize) -> Option<String> {
    let mut sequences: Vec<u64> = records
        .iter()
        .filter(|r| r.kind == BackupKind::Incremental)
        .map(|r| r.sequence)
        .collect();
    sequences.sort_unstable();
    sequences.dedup();

    let mut longest = 0usize;
    let mut current = 0usize;
    let mut prev: Option<u64> = None;
    for seq in sequences {
        current = match prev {
            Some(p) if seq == p + 1 => current + 1,
            _ => 1,
        };
        longest = longest.max(current);
        prev = Some(seq);
    }

    if longest < min_chain {
        Some(format!(
            "incremental chain too short: {longest} contiguous, need {min_chain}"
        ))
    } else {
        None
    }
}

/// Runs the sweep over a business's document-store clusters.
///
/// # Errors
///
/// Returns an error if the inventory or backup repository fails.
#[tracing::instrument(skip(inventory, backups, config), fields(biz_id = %biz_id))]
pub async fn sweep_backup_audit(
    inventory: &dyn InventoryRepository,
    backups: &dyn BackupRepository,
    biz_id: BizId,
    config: &BackupAuditConfig,
    now: DateTime<Utc>,
) -> Result<Vec<AuditRow>> {
    let mut rows = Vec::new();

    for cluster in inventory.clusters_by_biz(biz_id).await? {
        if cluster.cluster_type != ClusterType::MongoCluster {
            continue;
        }
        if now - cluster.created_at < config.min_age {
            continue;
        }

        let backup_tag = cluster.tags.get("backup").map(String::as_str);
        if matches!(backup_tag, Some("no" | "false")) {
            rows.push(AuditRow {
                cluster_id: cluster.id,
                domain: cluster.domain.clone(),
                shard_id: None,
                ok: true,
                message: "skipped: backup disabled by tag".to_owned(),
            });
            continue;
        }
        if cluster.tags.get("temporary").map(String::as_str) == Some("true") {
            rows.push(AuditRow {
                cluster_id: cluster.id,
                domain: cluster.domain.clone(),
                shard_id: None,
                ok: true,
                message: "skipped: temporary cluster".to_owned(),
            });
            continue;
        }

        let records = backups.records(cluster.id, now - config.lookback).await?;
        let shard_ids: Vec<u32> = if cluster.shards.is_empty() {
            vec![0]
        } else {
            cluster.shards.iter().map(|s| s.shard_id).collect()
        };

        let mut shard_failures = 0usize;
        for shard_id in &shard_ids {
            let shard_records: Vec<&BackupRecord> =
                records.iter().filter(|r| r.shard_id == *shard_id).collect();

            for failure in [
                shard_full_ok(&shard_records, config.max_full_duration),
                shard_chain_ok(&shard_records, config.min_incremental_chain),
            ]
            .into_iter()
            .flatten()
            {
                shard_failures += 1;
                rows.push(AuditRow {
                    cluster_id: cluster.id,
                    domain: cluster.domain.clone(),
                    shard_id: Some(*shard_id),
                    ok: false,
                    message: failure,
                });
            }
        }

        if shard_failures == 0 {
            rows.push(AuditRow {
                cluster_id: cluster.id,
                domain: cluster.domain.clone(),
                shard_id: None,
                ok: true,
                message: format!("all {} shards ok", shard_ids.len()),
            });
        }
    }

    Ok(rows)
}
