//! Drill and audit scenarios: backup sweep, health audit, failover drill.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use herd_core::BizId;
use herd_flow::config::PollConfig;
use herd_flow::drill::{
    audit_health, sweep_backup_audit, BackupAuditConfig, DrillSpec, DrillStep, FailoverDrill,
    NodeHealth,
};
use herd_flow::error::Result;
use herd_flow::external::{
    BackupKind, BackupRecord, ClusterStatus, ClusterType, HostSpec, ResourceApplyResult,
    ResourceResultCode, Series, ShardMeta, UnifyQueryResult,
};
use herd_flow::testing;
use herd_flow::ticket::TicketType;

fn backup(shard: u32, kind: BackupKind, duration_hours: i64, sequence: u64) -> BackupRecord {
    let finished = Utc::now() - Duration::hours(2);
    BackupRecord {
        shard_id: shard,
        kind,
        started_at: finished - Duration::hours(duration_hours),
        finished_at: finished,
        sequence,
    }
}

fn audit_config() -> BackupAuditConfig {
    BackupAuditConfig {
        min_age: Duration::hours(24),
        lookback: Duration::hours(24),
        max_full_duration: Duration::hours(8),
        min_incremental_chain: 12,
    }
}

/// S5: three healthy shards collapse into a single ok row.
#[tokio::test]
async fn backup_audit_all_shards_ok() -> Result<()> {
    let engine = testing::engine();
    let mut meta = testing::cluster_meta(7, 3, ClusterType::MongoCluster, "docs.example");
    meta.created_at = Utc::now() - Duration::days(30);
    meta.shards = (0..3)
        .map(|i| ShardMeta {
            shard_id: i,
            name: format!("s{i}"),
        })
        .collect();
    engine.stage.inventory.put_cluster(meta)?;

    for shard in 0..3 {
        engine
            .stage
            .backups
            .push(7.into(), backup(shard, BackupKind::Full, 2, 0))?;
        for seq in 1..=12 {
            engine
                .stage
                .backups
                .push(7.into(), backup(shard, BackupKind::Incremental, 1, seq))?;
        }
    }

    let rows = sweep_backup_audit(
        engine.stage.inventory.as_ref(),
        engine.stage.backups.as_ref(),
        BizId::new(3),
        &audit_config(),
        Utc::now(),
    )
    .await?;

    assert_eq!(rows.len(), 1);
    assert!(rows[0].ok);
    assert_eq!(rows[0].message, "all 3 shards ok");
    Ok(())
}

/// Tagged clusters are skipped with a report row; broken shards get
/// per-shard failure rows.
#[tokio::test]
async fn backup_audit_tags_and_failures() -> Result<()> {
    let engine = testing::engine();

    let mut tagged = testing::cluster_meta(8, 3, ClusterType::MongoCluster, "tmp.example");
    tagged.created_at = Utc::now() - Duration::days(30);
    tagged.tags.insert("temporary".into(), "true".into());
    engine.stage.inventory.put_cluster(tagged)?;

    let mut broken = testing::cluster_meta(9, 3, ClusterType::MongoCluster, "broken.example");
    broken.created_at = Utc::now() - Duration::days(30);
    broken.shards = vec![ShardMeta {
        shard_id: 0,
        name: "s0".into(),
    }];
    engine.stage.inventory.put_cluster(broken)?;
    // A slow FULL and a short incremental chain.
    engine
        .stage
        .backups
        .push(9.into(), backup(0, BackupKind::Full, 9, 0))?;
    engine
        .stage
        .backups
        .push(9.into(), backup(0, BackupKind::Incremental, 1, 1))?;

    let rows = sweep_backup_audit(
        engine.stage.inventory.as_ref(),
        engine.stage.backups.as_ref(),
        BizId::new(3),
        &audit_config(),
        Utc::now(),
    )
    .await?;

    let tmp_row = rows
        .iter()
        .find(|r| r.domain == "tmp.example")
        .expect("tag row");
    assert!(tmp_row.message.contains("temporary"));

    let failures: Vec<_> = rows
        .iter()
        .filter(|r| r.domain == "broken.example" && !r.ok)
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|r| r.message.contains("8h")));
    assert!(failures.iter().any(|r| r.message.contains("chain")));
    Ok(())
}

/// Health audit classifies every expected node.
#[tokio::test]
async fn health_audit_rows_per_node() -> Result<()> {
    let engine = testing::engine();
    let meta = testing::cluster_meta(11, 3, ClusterType::TendbHa, "ha.example");
    let healthy_instance = format!("{}:{}", meta.members[0].host, meta.members[0].port);
    engine.stage.inventory.put_cluster(meta)?;

    // Only the first member reports; with value 1 and the right role.
    let mut dims = BTreeMap::new();
    dims.insert("instance".to_owned(), healthy_instance);
    dims.insert("instance_role".to_owned(), "storage".to_owned());
    dims.insert("cluster_domain".to_owned(), "ha.example".to_owned());
    engine.stage.tsdb.script(
        "mysql_up",
        UnifyQueryResult {
            series: vec![Series {
                dimensions: dims,
                datapoints: vec![(1.0, 1_000)],
            }],
        },
    )?;

    let rows = audit_health(
        engine.stage.inventory.as_ref(),
        engine.stage.tsdb.as_ref(),
        BizId::new(3),
        Duration::minutes(5),
        Utc::now(),
    )
    .await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].health, NodeHealth::Ok);
    assert_eq!(rows[1].health, NodeHealth::MetricNotFound);
    Ok(())
}

/// Health audit flags a wrong role label and a non-1 value.
#[tokio::test]
async fn health_audit_flags_bad_series() -> Result<()> {
    let engine = testing::engine();
    let meta = testing::cluster_meta(12, 3, ClusterType::TendbHa, "ha2.example");
    let first = format!("{}:{}", meta.members[0].host, meta.members[0].port);
    let second = format!("{}:{}", meta.members[1].host, meta.members[1].port);
    engine.stage.inventory.put_cluster(meta)?;

    let mut down_dims = BTreeMap::new();
    down_dims.insert("instance".to_owned(), first);
    down_dims.insert("instance_role".to_owned(), "storage".to_owned());
    down_dims.insert("cluster_domain".to_owned(), "ha2.example".to_owned());
    let mut mislabeled_dims = BTreeMap::new();
    mislabeled_dims.insert("instance".to_owned(), second);
    mislabeled_dims.insert("instance_role".to_owned(), "proxy".to_owned());
    mislabeled_dims.insert("cluster_domain".to_owned(), "ha2.example".to_owned());

    engine.stage.tsdb.script(
        "mysql_up",
        UnifyQueryResult {
            series: vec![
                Series {
                    dimensions: down_dims,
                    datapoints: vec![(0.0, 1_000)],
                },
                Series {
                    dimensions: mislabeled_dims,
                    datapoints: vec![(1.0, 1_000)],
                },
            ],
        },
    )?;

    let rows = audit_health(
        engine.stage.inventory.as_ref(),
        engine.stage.tsdb.as_ref(),
        BizId::new(3),
        Duration::minutes(5),
        Utc::now(),
    )
    .await?;

    assert_eq!(rows[0].health, NodeHealth::ValueNot1);
    assert_eq!(rows[1].health, NodeHealth::BadInstanceRoleLabel);
    Ok(())
}

/// The catalog job wraps the sweep and notifies on failures.
#[tokio::test]
async fn backup_audit_job_notifies_failures() -> Result<()> {
    use herd_flow::schedule::jobs::BackupAuditJob;
    use herd_flow::schedule::{InstanceLog, Job};

    let engine = testing::engine();
    let mut broken = testing::cluster_meta(10, 3, ClusterType::MongoCluster, "nobackup.example");
    broken.created_at = Utc::now() - Duration::days(30);
    engine.stage.inventory.put_cluster(broken)?;

    let job = BackupAuditJob::new(
        Arc::clone(&engine.stage.inventory) as _,
        Arc::clone(&engine.stage.backups) as _,
        Arc::clone(&engine.stage.notifier) as _,
        vec![BizId::new(3)],
        vec!["chan-dba".into()],
        audit_config(),
    );

    let mut log = InstanceLog::new();
    job.run(&mut log).await?;

    assert!(log
        .lines()
        .iter()
        .any(|l| l.contains("no FULL backup")));
    let sent = engine.stage.notifier.sent()?;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.contains("backup audit"));
    Ok(())
}

fn drill_spec() -> DrillSpec {
    DrillSpec {
        cluster_type: ClusterType::TendbHa,
        biz_id: BizId::new(3),
        spec: "SA2.SMALL4".into(),
        domain: "drill-ha.example".into(),
        city: None,
    }
}

fn drill_poll() -> PollConfig {
    PollConfig {
        max_retry: 3,
        interval_ms: 1,
    }
}

/// S6: the switch never happens; the drill reports and aborts without
/// destroying.
#[tokio::test]
async fn failover_drill_switch_timeout() -> Result<()> {
    let engine = testing::engine();
    engine.disable_gates(TicketType::FailoverDrill)?;

    // Drill cluster exists (built by the build step in production).
    engine.stage.inventory.put_cluster(testing::cluster_meta(
        99,
        3,
        ClusterType::TendbHa,
        "drill-ha.example",
    ))?;
    engine.stage.broker.push_result(ResourceApplyResult {
        code: ResourceResultCode::Ok,
        hosts: vec![HostSpec {
            host: "10.0.99.1".into(),
            cloud_id: 0,
            spec: "SA2.SMALL4".into(),
        }],
        request_id: "req-drill".into(),
    })?;

    // The build workflow must succeed...
    let drill = FailoverDrill::new(
        Arc::new(herd_flow::external::memory::ScriptedActuator::reporting(
            herd_flow::external::WorkflowState::Succeeded,
        )),
        Arc::clone(&engine.stage.broker) as _,
        Arc::clone(&engine.stage.inventory) as _,
        Arc::clone(&engine.service),
        drill_poll(),
    );

    // ...but the cluster status stays Normal: the await-switch step times
    // out.
    let report = drill.execute(&drill_spec()).await?;

    assert!(!report.ok);
    assert_eq!(report.dbha_status, "not_switched");
    let last = report.steps.last().expect("steps");
    assert_eq!(last.step, DrillStep::AwaitSwitch);
    assert_eq!(
        last.message,
        "cluster status unchanged, dbha may not have switched"
    );
    // No destroy, no resource return.
    assert!(!report
        .steps
        .iter()
        .any(|s| matches!(s.step, DrillStep::Destroy | DrillStep::ReturnResources)));
    assert!(engine.stage.broker.imports()?.is_empty());
    Ok(())
}

/// The full drill path: switch observed, cluster torn down, hosts returned.
#[tokio::test]
async fn failover_drill_full_path() -> Result<()> {
    let engine = testing::engine();
    engine.disable_gates(TicketType::FailoverDrill)?;

    engine.stage.inventory.put_cluster(testing::cluster_meta(
        99,
        3,
        ClusterType::TendbHa,
        "drill-ha.example",
    ))?;
    // The HA daemon "switches" immediately.
    engine
        .stage
        .inventory
        .set_cluster_status(99.into(), ClusterStatus::Abnormal)?;
    engine.stage.broker.push_result(ResourceApplyResult {
        code: ResourceResultCode::Ok,
        hosts: vec![HostSpec {
            host: "10.0.99.1".into(),
            cloud_id: 0,
            spec: "SA2.SMALL4".into(),
        }],
        request_id: "req-drill".into(),
    })?;

    let drill = FailoverDrill::new(
        Arc::new(herd_flow::external::memory::ScriptedActuator::reporting(
            herd_flow::external::WorkflowState::Succeeded,
        )),
        Arc::clone(&engine.stage.broker) as _,
        Arc::clone(&engine.stage.inventory) as _,
        Arc::clone(&engine.service),
        drill_poll(),
    );

    let report = drill.execute(&drill_spec()).await?;

    assert!(report.ok, "steps: {:?}", report.steps);
    assert_eq!(report.dbha_status, "switched");
    assert_eq!(report.steps.len(), 7);
    assert_eq!(engine.stage.broker.imports()?.len(), 1);
    Ok(())
}
