//! Test support: a pre-wired engine over the in-memory collaborators.
//!
//! Unit and integration tests build a [`TestStage`] and drive runners or the
//! manager against it; the concrete fakes stay reachable for scripting and
//! inspection. Nothing here is for production use.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use chrono::Utc;

use herd_core::{BizId, ClusterId};

use crate::builders::default_registry;
use crate::config::EngineConfig;
use crate::exclusion::{ExclusionMatrix, MatrixHandle};
use crate::manager::FlowManager;
use crate::recycle::RecycleDispatcher;
use crate::registry::{ConfigScope, FlowConfigRule, FlowConfigStore, TicketService};
use crate::ticket::TicketType;
use crate::external::memory::{
    MemoryApprovalGateway, MemoryBackups, MemoryBroker, MemoryInventory, MemorySwitchQueue,
    RecordingNotifier, ScriptedActuator, ScriptedTimeSeries,
};
use crate::external::{ClusterMeta, ClusterStatus, ClusterType, InstanceMeta, InstanceRole};
use crate::ledger::memory::InMemoryLedger;
use crate::runner::StageContext;
use crate::store::memory::InMemoryTicketStore;

/// A permissive default matrix for tests: the common mysql pairs that do not
/// conflict are marked `N`; everything else conflicts (the safe default).
pub const TEST_MATRIX: &str = "\
,MYSQL_HA_APPLY,MYSQL_HA_FULL_BACKUP,MYSQL_MASTER_SLAVE_SWITCH,MYSQL_PROXY_SWITCH,MYSQL_MIGRATE_CLUSTER,MYSQL_ROLLBACK_CLUSTER
MYSQL_HA_APPLY,N,N,N,N,N,N
MYSQL_HA_FULL_BACKUP,N,N,Y,N,Y,Y
MYSQL_MASTER_SLAVE_SWITCH,N,Y,Y,N,Y,Y
MYSQL_PROXY_SWITCH,N,N,Y,Y,Y,N
MYSQL_MIGRATE_CLUSTER,N,Y,Y,Y,Y,Y
MYSQL_ROLLBACK_CLUSTER,N,Y,Y,N,Y,Y
";

/// A stage context plus handles to the concrete fakes behind it.
pub struct TestStage {
    /// The concrete in-memory ticket store.
    pub store: Arc<InMemoryTicketStore>,
    /// The concrete in-memory ledger.
    pub ledger: Arc<InMemoryLedger>,
    /// The inventory fake.
    pub inventory: Arc<MemoryInventory>,
    /// The actuator fake.
    pub actuator: Arc<ScriptedActuator>,
    /// The broker fake.
    pub broker: Arc<MemoryBroker>,
    /// The notifier fake.
    pub notifier: Arc<RecordingNotifier>,
    /// The approval gateway fake.
    pub approvals: Arc<MemoryApprovalGateway>,
    /// The exclusion matrix handle.
    pub matrix: Arc<MatrixHandle>,
    /// The backup repository fake.
    pub backups: Arc<MemoryBackups>,
    /// The time-series fake.
    pub tsdb: Arc<ScriptedTimeSeries>,
    /// The switch queue fake.
    pub switch_queue: Arc<MemorySwitchQueue>,
    /// The wired stage context.
    ctx: StageContext,
}

impl Deref for TestStage {
    type Target = StageContext;

    fn deref(&self) -> &StageContext {
        &self.ctx
    }
}

impl TestStage {
    /// Returns the wired stage context.
    #[must_use]
    pub fn context(&self) -> StageContext {
        self.ctx.clone()
    }
}

/// Builds a stage context over fresh in-memory fakes with [`TEST_MATRIX`]
/// loaded and default engine config.
#[must_use]
pub fn stage_context() -> TestStage {
    stage_context_with(EngineConfig::default())
}

/// Builds a stage context with a custom engine config.
///
/// # Panics
///
/// Panics if the built-in test matrix fails to parse (a bug in this module).
#[must_use]
pub fn stage_context_with(config: EngineConfig) -> TestStage {
    let matrix = Arc::new(MatrixHandle::new(
        ExclusionMatrix::parse(TEST_MATRIX).expect("test matrix parses"),
    ));
    let store = Arc::new(InMemoryTicketStore::new());
    let ledger = Arc::new(InMemoryLedger::new(Arc::clone(&matrix)));
    let inventory = Arc::new(MemoryInventory::new());
    let actuator = Arc::new(ScriptedActuator::new());
    let broker = Arc::new(MemoryBroker::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let approvals = Arc::new(MemoryApprovalGateway::new());
    let backups = Arc::new(MemoryBackups::new());
    let tsdb = Arc::new(ScriptedTimeSeries::new());
    let switch_queue = Arc::new(MemorySwitchQueue::new());

    let ctx = StageContext {
        store: Arc::clone(&store) as _,
        ledger: Arc::clone(&ledger) as _,
        actuator: Arc::clone(&actuator) as _,
        approvals: Arc::clone(&approvals) as _,
        broker: Arc::clone(&broker) as _,
        inventory: Arc::clone(&inventory) as _,
        notifier: Arc::clone(&notifier) as _,
        config,
    };

    TestStage {
        store,
        ledger,
        inventory,
        actuator,
        broker,
        notifier,
        approvals,
        matrix,
        backups,
        tsdb,
        switch_queue,
        ctx,
    }
}

/// Returns the inventory fake behind a test stage.
#[must_use]
pub fn inventory(stage: &TestStage) -> &MemoryInventory {
    &stage.inventory
}

/// Returns the actuator fake behind a test stage.
#[must_use]
pub fn actuator(stage: &TestStage) -> &ScriptedActuator {
    &stage.actuator
}

/// Returns the broker fake behind a test stage.
#[must_use]
pub fn broker(stage: &TestStage) -> &MemoryBroker {
    &stage.broker
}

/// Returns the notifier fake behind a test stage.
#[must_use]
pub fn notifier(stage: &TestStage) -> &RecordingNotifier {
    &stage.notifier
}

/// Returns the approval gateway fake behind a test stage.
#[must_use]
pub fn approvals(stage: &TestStage) -> &MemoryApprovalGateway {
    &stage.approvals
}

/// A fully wired engine: manager, service, recycle dispatcher, and the
/// fakes behind them.
pub struct TestEngine {
    /// The stage context and fakes.
    pub stage: TestStage,
    /// The flow manager.
    pub manager: Arc<FlowManager>,
    /// The ticket service with the default builder registry.
    pub service: Arc<TicketService>,
    /// The flow-config rules.
    pub flow_configs: Arc<FlowConfigStore>,
}

impl TestEngine {
    /// Disables the approval and confirm gates for a ticket type
    /// (platform-wide rule).
    ///
    /// # Errors
    ///
    /// Returns an error if the rule store lock is poisoned.
    pub fn disable_gates(&self, ticket_type: TicketType) -> crate::error::Result<()> {
        self.flow_configs.put(FlowConfigRule {
            scope: ConfigScope::Platform,
            ticket_type,
            need_approval: false,
            need_confirm: false,
            editable: true,
        })
    }
}

/// Builds a fully wired engine over fresh in-memory fakes.
///
/// # Panics
///
/// Panics if wiring the recycle dispatcher fails (a bug in this module).
#[must_use]
pub fn engine() -> TestEngine {
    engine_with(EngineConfig::default())
}

/// Builds a fully wired engine with a custom config.
///
/// # Panics
///
/// Panics if wiring the recycle dispatcher fails (a bug in this module).
#[must_use]
pub fn engine_with(config: EngineConfig) -> TestEngine {
    let stage = stage_context_with(config);
    let manager = Arc::new(FlowManager::new(stage.context()));
    let flow_configs = Arc::new(FlowConfigStore::new());
    let service = Arc::new(TicketService::new(
        default_registry(),
        Arc::clone(&flow_configs),
        Arc::clone(&manager),
    ));
    manager
        .set_follow_up(Arc::new(RecycleDispatcher::new(Arc::clone(&service))))
        .expect("wire recycle dispatcher");

    TestEngine {
        stage,
        manager,
        service,
        flow_configs,
    }
}

/// Builds a minimal cluster for tests.
#[must_use]
pub fn cluster_meta(id: u64, biz: u64, cluster_type: ClusterType, domain: &str) -> ClusterMeta {
    ClusterMeta {
        id: ClusterId::new(id),
        biz_id: BizId::new(biz),
        cluster_type,
        domain: domain.to_owned(),
        status: ClusterStatus::Normal,
        cloud_id: 0,
        tags: BTreeMap::new(),
        shards: vec![],
        members: vec![
            InstanceMeta {
                host: format!("10.0.{id}.1"),
                port: 3306,
                role: InstanceRole::Storage,
            },
            InstanceMeta {
                host: format!("10.0.{id}.2"),
                port: 3306,
                role: InstanceRole::Storage,
            },
        ],
        created_at: Utc::now(),
    }
}
