//! End-to-end ticket scenarios through a fully wired engine.

use serde_json::json;

use herd_core::{BizId, TicketId};
use herd_flow::bag::Bag;
use herd_flow::error::{ErrorCode, Result};
use herd_flow::external::{ActuatorDispatcher, ClusterType, WorkflowState};
use herd_flow::flow::{FlowStatus, FlowType};
use herd_flow::ledger::OperationLedger;
use herd_flow::manager::{
    ApprovalCallback, ApprovalResult, CallbackResult, ConfirmOutcome, WorkflowCallback,
};
use herd_flow::registry::CreateTicketRequest;
use herd_flow::store::TicketStore;
use herd_flow::testing::{self, TestEngine};
use herd_flow::ticket::{TicketStatus, TicketType};
use herd_flow::todo::TodoStatus;

fn bag(value: serde_json::Value) -> Bag {
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("test bags are objects"),
    }
}

fn request(ticket_type: TicketType, details: serde_json::Value) -> CreateTicketRequest {
    CreateTicketRequest {
        ticket_type,
        bk_biz_id: BizId::new(3),
        details: bag(details),
        creator: "alice".into(),
        remark: "test".into(),
        auto_execute: true,
        helpers: vec![],
        notify_channels: vec![],
    }
}

async fn seed_mysql_cluster(engine: &TestEngine, id: u64) -> Result<()> {
    engine.stage.inventory.put_cluster(testing::cluster_meta(
        id,
        3,
        ClusterType::TendbHa,
        &format!("db{id}.example"),
    ))?;
    engine
        .stage
        .inventory
        .set_biz_dba(BizId::new(3), vec!["alice".into()])?;
    Ok(())
}

async fn workflow_root(engine: &TestEngine, ticket_id: TicketId, ordinal: u32) -> Result<String> {
    let flows = engine
        .stage
        .store
        .flows_for_ticket(ticket_id)
        .await?;
    Ok(flows
        .iter()
        .find(|f| f.ordinal == ordinal)
        .and_then(|f| f.flow_object_id.clone())
        .expect("flow object id"))
}

async fn ticket_status(engine: &TestEngine, ticket_id: TicketId) -> Result<TicketStatus> {
    Ok(engine
        .stage
        .store
        .get_ticket(ticket_id)
        .await?
        .expect("ticket")
        .status)
}

/// S1: happy path for a relational HA apply.
#[tokio::test]
async fn happy_path_mysql_ha_apply() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;

    let ticket_id = engine
        .service
        .create_ticket(request(
            TicketType::MysqlHaApply,
            json!({"spec": "SA2.SMALL4", "domains": [{"key": "kio"}]}),
        ))
        .await?;

    // Pipeline: APPROVAL -> HUMAN-CONFIRM -> INNER-WORKFLOW -> DELIVERY.
    let flows = engine.stage.store.flows_for_ticket(ticket_id).await?;
    assert_eq!(
        flows.iter().map(|f| f.flow_type).collect::<Vec<_>>(),
        vec![
            FlowType::Approval,
            FlowType::HumanConfirm,
            FlowType::InnerWorkflow,
            FlowType::Delivery
        ]
    );
    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::ApproveWaiting
    );

    // Approve.
    let handle = workflow_root(&engine, ticket_id, 0).await?;
    engine
        .manager
        .handle_approval_callback(ApprovalCallback {
            handle,
            result: ApprovalResult::Approved,
        })
        .await?;
    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::TodoWaiting
    );

    // Confirm.
    let flows = engine.stage.store.flows_for_ticket(ticket_id).await?;
    let todos = engine.stage.store.todos_for_flow(flows[1].id).await?;
    let outcome = engine
        .manager
        .confirm_todo(todos[0].id, "alice", true, None)
        .await?;
    assert_eq!(outcome, ConfirmOutcome::Proceeded);
    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::Running
    );

    // Workflow completes.
    let root = workflow_root(&engine, ticket_id, 2).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;

    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::Succeeded
    );
    // No ledger records remain.
    assert!(engine
        .stage
        .ledger
        .records_for_ticket(ticket_id)
        .await?
        .is_empty());
    Ok(())
}

/// S2: exclusion on a shared cluster, then retry after the blocker ends.
#[tokio::test]
async fn exclusion_rejects_then_retry_succeeds() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;
    engine.disable_gates(TicketType::MysqlMasterSlaveSwitch)?;
    engine.disable_gates(TicketType::MysqlHaFullBackup)?;

    // T1 holds cluster 125 in its inner workflow.
    let t1 = engine
        .service
        .create_ticket(request(
            TicketType::MysqlMasterSlaveSwitch,
            json!({"cluster_ids": [125]}),
        ))
        .await?;
    assert_eq!(ticket_status(&engine, t1).await?, TicketStatus::Running);

    // T2 conflicts and fails immediately with the blocker's id.
    let t2 = engine
        .service
        .create_ticket(request(
            TicketType::MysqlHaFullBackup,
            json!({"cluster_ids": [125]}),
        ))
        .await?;
    assert_eq!(ticket_status(&engine, t2).await?, TicketStatus::Failed);

    let t2_flows = engine.stage.store.flows_for_ticket(t2).await?;
    let failed = t2_flows
        .iter()
        .find(|f| f.status == FlowStatus::Failed)
        .expect("failed flow");
    assert_eq!(failed.err_code, Some(ErrorCode::InnerFail));
    assert_eq!(
        failed.err_msg.as_deref(),
        Some(format!("exclusive with ticket {t1}").as_str())
    );

    // T1 completes; its record is torn down.
    let root = workflow_root(&engine, t1, 0).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;
    assert_eq!(ticket_status(&engine, t1).await?, TicketStatus::Succeeded);

    // Human retries T2; it now starts and completes.
    engine.manager.retry(t2).await?;
    assert_eq!(ticket_status(&engine, t2).await?, TicketStatus::Running);

    let root = workflow_root(&engine, t2, 0).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;
    assert_eq!(ticket_status(&engine, t2).await?, TicketStatus::Succeeded);
    Ok(())
}

/// S3: the PAUSE gate re-engages the mutex for released types and re-checks
/// before opening.
#[tokio::test]
async fn pause_gate_with_release_unlock() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;
    engine.disable_gates(TicketType::MysqlMigrateCluster)?;
    engine.disable_gates(TicketType::MysqlProxySwitch)?;

    engine
        .stage
        .broker
        .push_result(herd_flow::external::ResourceApplyResult {
            code: herd_flow::external::ResourceResultCode::Ok,
            hosts: vec![herd_flow::external::HostSpec {
                host: "10.0.0.9".into(),
                cloud_id: 0,
                spec: "SA2.SMALL4".into(),
            }],
            request_id: "req-1".into(),
        })?;

    // Migration: resources -> migrate (unlock window) -> pause -> cutover.
    let migration = engine
        .service
        .create_ticket(request(
            TicketType::MysqlMigrateCluster,
            json!({"cluster_ids": [125], "spec": "SA2.SMALL4", "count": 1}),
        ))
        .await?;
    assert_eq!(
        ticket_status(&engine, migration).await?,
        TicketStatus::Running
    );

    // During the unlocked window a proxy switch is admitted.
    let proxy = engine
        .service
        .create_ticket(request(
            TicketType::MysqlProxySwitch,
            json!({"cluster_ids": [125]}),
        ))
        .await?;
    assert_eq!(ticket_status(&engine, proxy).await?, TicketStatus::Running);

    // The migration's data copy finishes; the PAUSE gate parks.
    let root = workflow_root(&engine, migration, 1).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;
    assert_eq!(
        ticket_status(&engine, migration).await?,
        TicketStatus::TodoWaiting
    );

    // A NEW proxy switch submitted while paused is rejected.
    let late_proxy = engine
        .service
        .create_ticket(request(
            TicketType::MysqlProxySwitch,
            json!({"cluster_ids": [125]}),
        ))
        .await?;
    assert_eq!(
        ticket_status(&engine, late_proxy).await?,
        TicketStatus::Failed
    );

    // Human continue while the admitted proxy switch still runs: wait.
    let migration_flows = engine.stage.store.flows_for_ticket(migration).await?;
    let pause_flow = migration_flows
        .iter()
        .find(|f| f.flow_type == FlowType::PauseWithLockCheck)
        .expect("pause flow");
    let todos = engine.stage.store.todos_for_flow(pause_flow.id).await?;
    let outcome = engine
        .manager
        .confirm_todo(todos[0].id, "alice", true, None)
        .await?;
    match outcome {
        ConfirmOutcome::Waiting(message) => {
            assert!(message.contains(&proxy.to_string()));
        }
        other => panic!("expected Waiting, got {other:?}"),
    }

    // The proxy switch finishes; continue now opens the gate.
    let root = workflow_root(&engine, proxy, 0).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;

    let outcome = engine
        .manager
        .confirm_todo(todos[0].id, "alice", true, None)
        .await?;
    assert_eq!(outcome, ConfirmOutcome::Proceeded);
    assert_eq!(
        ticket_status(&engine, migration).await?,
        TicketStatus::Running
    );
    Ok(())
}

/// A blocked pause gate is opened by the ticker once the conflict clears.
#[tokio::test]
async fn pause_gate_opened_by_recheck_ticker() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;
    engine.disable_gates(TicketType::MysqlMigrateCluster)?;
    engine.disable_gates(TicketType::MysqlProxySwitch)?;
    engine
        .stage
        .broker
        .push_result(herd_flow::external::ResourceApplyResult {
            code: herd_flow::external::ResourceResultCode::Ok,
            hosts: vec![],
            request_id: "req-2".into(),
        })?;

    let migration = engine
        .service
        .create_ticket(request(
            TicketType::MysqlMigrateCluster,
            json!({"cluster_ids": [125], "spec": "SA2.SMALL4", "count": 1}),
        ))
        .await?;
    let proxy = engine
        .service
        .create_ticket(request(
            TicketType::MysqlProxySwitch,
            json!({"cluster_ids": [125]}),
        ))
        .await?;

    // Park the migration at the pause gate.
    let root = workflow_root(&engine, migration, 1).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;

    // Human asks to continue; the proxy switch still blocks.
    let flows = engine.stage.store.flows_for_ticket(migration).await?;
    let pause_flow = flows
        .iter()
        .find(|f| f.flow_type == FlowType::PauseWithLockCheck)
        .expect("pause flow");
    let todos = engine.stage.store.todos_for_flow(pause_flow.id).await?;
    let outcome = engine
        .manager
        .confirm_todo(todos[0].id, "alice", true, None)
        .await?;
    assert!(matches!(outcome, ConfirmOutcome::Waiting(_)));

    // Nothing to open yet.
    assert_eq!(engine.manager.recheck_paused_gates().await?, 0);

    // The blocker finishes; the next tick opens the gate.
    let root = workflow_root(&engine, proxy, 0).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Succeeded,
            transient: false,
            message: None,
            output: None,
        })
        .await?;

    assert_eq!(engine.manager.recheck_paused_gates().await?, 1);
    assert_eq!(
        ticket_status(&engine, migration).await?,
        TicketStatus::Running
    );
    let todos = engine.stage.store.todos_for_flow(pause_flow.id).await?;
    assert_eq!(todos[0].status, TodoStatus::DoneSuccess);
    Ok(())
}

/// S4: user termination formats the reason from the todo.
#[tokio::test]
async fn user_terminate_formats_reason() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;

    let ticket_id = engine
        .service
        .create_ticket(request(
            TicketType::MysqlHaFullBackup,
            json!({"cluster_ids": [125]}),
        ))
        .await?;

    // Approve, then terminate at the confirm gate.
    let handle = workflow_root(&engine, ticket_id, 0).await?;
    engine
        .manager
        .handle_approval_callback(ApprovalCallback {
            handle,
            result: ApprovalResult::Approved,
        })
        .await?;
    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::TodoWaiting
    );

    engine.manager.terminate(ticket_id, "alice", "abort").await?;

    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::Terminated
    );
    let summary = engine.manager.summary(ticket_id).await?;
    assert_eq!(
        summary.terminate_reason.as_deref(),
        Some("alice handled (manual terminate, remark: abort)")
    );

    let flows = engine.stage.store.flows_for_ticket(ticket_id).await?;
    let confirm = flows
        .iter()
        .find(|f| f.flow_type == FlowType::HumanConfirm)
        .expect("confirm flow");
    assert_eq!(confirm.status, FlowStatus::Terminated);
    let todos = engine.stage.store.todos_for_flow(confirm.id).await?;
    assert_eq!(todos[0].status, TodoStatus::DoneFailed);
    Ok(())
}

/// A stuck external workflow is cancelled, then force-terminated with the
/// timeout reason.
#[tokio::test]
async fn system_terminate_after_cancel_window() -> Result<()> {
    let mut config = herd_flow::config::EngineConfig::default();
    config.cancel_window_secs = 0;
    config.cancel_poll_interval_ms = 1;
    let engine = testing::engine_with(config);
    seed_mysql_cluster(&engine, 125).await?;
    engine.disable_gates(TicketType::MysqlMasterSlaveSwitch)?;

    let ticket_id = engine
        .service
        .create_ticket(request(
            TicketType::MysqlMasterSlaveSwitch,
            json!({"cluster_ids": [125]}),
        ))
        .await?;
    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::Running
    );

    // The workflow never reaches a terminal state; the cancel window is 0.
    engine.manager.terminate(ticket_id, "alice", "stuck").await?;

    assert_eq!(
        ticket_status(&engine, ticket_id).await?,
        TicketStatus::Terminated
    );
    let reason = engine.manager.get_terminate_reason(ticket_id).await?;
    assert_eq!(reason.as_deref(), Some("timeout auto-terminate"));

    // Cancellation was requested at the actuator.
    assert_eq!(engine.stage.actuator.cancelled()?.len(), 1);
    // Ledger records were torn down.
    assert!(engine
        .stage
        .ledger
        .records_for_ticket(ticket_id)
        .await?
        .is_empty());
    Ok(())
}

/// A failed ticket holding allocated hosts spawns a resource-return child
/// linked through a DELIVERY flow.
#[tokio::test]
async fn failed_allocation_spawns_recycle_child() -> Result<()> {
    let engine = testing::engine();
    seed_mysql_cluster(&engine, 125).await?;
    engine.disable_gates(TicketType::MysqlRollbackCluster)?;
    engine.disable_gates(TicketType::ResourceReturn)?;

    engine
        .stage
        .broker
        .push_result(herd_flow::external::ResourceApplyResult {
            code: herd_flow::external::ResourceResultCode::Ok,
            hosts: vec![herd_flow::external::HostSpec {
                host: "10.0.0.9".into(),
                cloud_id: 0,
                spec: "SA2.SMALL4".into(),
            }],
            request_id: "req-1".into(),
        })?;

    let parent = engine
        .service
        .create_ticket(request(
            TicketType::MysqlRollbackCluster,
            json!({"cluster_ids": [125], "spec": "SA2.SMALL4", "count": 1}),
        ))
        .await?;
    assert_eq!(ticket_status(&engine, parent).await?, TicketStatus::Running);

    // The rollback workflow fails terminally.
    let root = workflow_root(&engine, parent, 1).await?;
    engine
        .manager
        .handle_workflow_callback(WorkflowCallback {
            root_id: root,
            result: CallbackResult::Failed,
            transient: false,
            message: Some("restore failed".into()),
            output: None,
        })
        .await?;
    assert_eq!(ticket_status(&engine, parent).await?, TicketStatus::Failed);

    // The parent grew a DELIVERY link to the child.
    let flows = engine.stage.store.flows_for_ticket(parent).await?;
    let link = flows
        .iter()
        .find(|f| f.alias == "recycle link")
        .expect("recycle link flow");
    assert_eq!(link.status, FlowStatus::Succeeded);
    let child_id: TicketId = link.details["related_ticket"]
        .as_str()
        .expect("related ticket")
        .parse()?;

    // The child is a running resource return for the allocated host.
    let child = engine
        .stage
        .store
        .get_ticket(child_id)
        .await?
        .expect("child ticket");
    assert_eq!(child.ticket_type, TicketType::ResourceReturn);
    assert_eq!(child.details["hosts"][0]["host"], "10.0.0.9");
    assert_eq!(
        child.details["parent_ticket_id"],
        parent.to_string().as_str()
    );
    Ok(())
}

/// Workflow states reported by the fake are what the engine believes.
#[tokio::test]
async fn actuator_scripting_sanity() -> Result<()> {
    let engine = testing::engine();
    engine.stage.actuator.script(
        "root-x",
        vec![WorkflowState::Running, WorkflowState::Succeeded],
    )?;
    assert_eq!(
        engine.stage.actuator.status("root-x").await?,
        WorkflowState::Running
    );
    assert_eq!(
        engine.stage.actuator.status("root-x").await?,
        WorkflowState::Succeeded
    );
    Ok(())
}
