//! Ticket builder registry and the ticket creation service.
//!
//! A ticket type registers three things: a details validator, a detail
//! patcher that enriches the bag with inventory data before pipeline
//! construction, and a pipeline factory emitting flow descriptors.
//! [`TicketService::create_ticket`] is the sole ticket constructor:
//! validate, patch, resolve flow-config policy, insert rows, optionally
//! execute.
//!
//! Dispatch is a registry keyed by [`TicketType`]; no runtime class
//! hierarchy.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId, TicketId};

use crate::bag::Bag;
use crate::error::{Error, Result};
use crate::external::InventoryRepository;
use crate::flow::{Flow, FlowDescriptor, FlowType, RetryPolicy};
use crate::manager::FlowManager;
use crate::metrics;
use crate::store::TicketStore;
use crate::ticket::{Ticket, TicketConfig, TicketType};

/// Scope of a flow-config rule. Resolution order: cluster > business >
/// platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "scope")]
pub enum ConfigScope {
    /// Applies platform-wide.
    Platform,
    /// Applies to one business.
    Biz {
        /// The business.
        biz_id: BizId,
    },
    /// Applies to an explicit cluster list.
    Clusters {
        /// The clusters.
        cluster_ids: Vec<ClusterId>,
    },
}

impl ConfigScope {
    const fn precedence(&self) -> u8 {
        match self {
            Self::Platform => 0,
            Self::Biz { .. } => 1,
            Self::Clusters { .. } => 2,
        }
    }
}

/// One flow-config rule: whether a ticket type gets approval and/or
/// confirmation gates in a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfigRule {
    /// Where the rule applies.
    #[serde(flatten)]
    pub scope: ConfigScope,
    /// The ticket type it governs.
    pub ticket_type: TicketType,
    /// Insert an APPROVAL stage.
    pub need_approval: bool,
    /// Insert a HUMAN-CONFIRM stage.
    pub need_confirm: bool,
    /// Whether operators may edit the rule.
    pub editable: bool,
}

/// Resolved gate policy for one ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    /// Insert an APPROVAL stage.
    pub need_approval: bool,
    /// Insert a HUMAN-CONFIRM stage.
    pub need_confirm: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        // Safe default: both gates on.
        Self {
            need_approval: true,
            need_confirm: true,
        }
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("flow config lock poisoned")
}

/// In-memory flow-config rule store with scope resolution.
#[derive(Debug, Default)]
pub struct FlowConfigStore {
    rules: RwLock<Vec<FlowConfigRule>>,
}

impl FlowConfigStore {
    /// Creates an empty store: every type gets the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn put(&self, rule: FlowConfigRule) -> Result<()> {
        let mut rules = self.rules.write().map_err(poison_err)?;
        rules.push(rule);
        Ok(())
    }

    /// Resolves the gate policy for a ticket: the matching rule with the
    /// most specific scope wins.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn resolve(
        &self,
        ticket_type: TicketType,
        biz_id: BizId,
        cluster_ids: &[ClusterId],
    ) -> Result<GatePolicy> {
        let rules = self.rules.read().map_err(poison_err)?;
        let best = rules
            .iter()
            .filter(|r| r.ticket_type == ticket_type)
            .filter(|r| match &r.scope {
                ConfigScope::Platform => true,
                ConfigScope::Biz { biz_id: b } => *b == biz_id,
                ConfigScope::Clusters { cluster_ids: cs } => {
                    cluster_ids.iter().any(|c| cs.contains(c))
                }
            })
            .max_by_key(|r| r.scope.precedence());

        Ok(best.map_or_else(GatePolicy::default, |r| GatePolicy {
            need_approval: r.need_approval,
            need_confirm: r.need_confirm,
        }))
    }
}

/// Per-type ticket construction logic.
#[async_trait]
pub trait TicketBuilder: Send + Sync {
    /// The type this builder constructs.
    fn ticket_type(&self) -> TicketType;

    /// Validates the raw detail bag. Rejection means no ticket is created.
    fn validate(&self, details: &Bag) -> Result<()>;

    /// Enriches the detail bag with inventory data and defaults before the
    /// pipeline is constructed. Returns a patch to append-merge.
    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag>;

    /// Emits the ordered pipeline for this ticket (without policy gates).
    fn flows(&self, ticket: &Ticket) -> Result<Vec<FlowDescriptor>>;

    /// Recycling policy: an optional follow-up child to spawn when the
    /// ticket reaches a terminal status.
    fn recycle(&self, _ticket: &Ticket, _flows: &[Flow]) -> Option<RecyclePlan> {
        None
    }
}

/// A follow-up child ticket to spawn on terminal state.
#[derive(Debug, Clone)]
pub struct RecyclePlan {
    /// Child ticket type.
    pub ticket_type: TicketType,
    /// Child detail bag.
    pub details: Bag,
    /// Child remark.
    pub remark: String,
}

/// Registry keyed by ticket type.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: HashMap<TicketType, Arc<dyn TicketBuilder>>,
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BuilderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a builder under its declared type.
    pub fn register(&mut self, builder: Arc<dyn TicketBuilder>) {
        self.builders.insert(builder.ticket_type(), builder);
    }

    /// Returns the builder for a type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTicketType`] when nothing is registered.
    pub fn get(&self, ticket_type: TicketType) -> Result<&Arc<dyn TicketBuilder>> {
        self.builders
            .get(&ticket_type)
            .ok_or_else(|| Error::UnknownTicketType {
                ticket_type: ticket_type.to_string(),
            })
    }

    /// Returns the registered types.
    #[must_use]
    pub fn types(&self) -> Vec<TicketType> {
        self.builders.keys().copied().collect()
    }
}

/// `POST create-ticket` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketRequest {
    /// Domain action.
    pub ticket_type: TicketType,
    /// Requesting business.
    pub bk_biz_id: BizId,
    /// Raw detail bag.
    pub details: Bag,
    /// Submitter.
    pub creator: String,
    /// Free-form remark.
    #[serde(default)]
    pub remark: String,
    /// Start the pipeline immediately.
    #[serde(default = "default_auto_execute")]
    pub auto_execute: bool,
    /// Extra humans allowed on todos.
    #[serde(default)]
    pub helpers: Vec<String>,
    /// Channels to notify on state changes.
    #[serde(default)]
    pub notify_channels: Vec<String>,
}

const fn default_auto_execute() -> bool {
    true
}

/// The sole ticket constructor.
pub struct TicketService {
    registry: BuilderRegistry,
    flow_configs: Arc<FlowConfigStore>,
    manager: Arc<FlowManager>,
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService").finish_non_exhaustive()
    }
}

impl TicketService {
    /// Creates a service over a registry, flow-config rules, and a manager.
    #[must_use]
    pub fn new(
        registry: BuilderRegistry,
        flow_configs: Arc<FlowConfigStore>,
        manager: Arc<FlowManager>,
    ) -> Self {
        Self {
            registry,
            flow_configs,
            manager,
        }
    }

    /// Returns the underlying manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<FlowManager> {
        &self.manager
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }

    /// Creates a ticket: validate, patch, build the pipeline (policy gates
    /// first), insert atomically, and optionally start executing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the details fail the builder's
    /// validator (no ticket is created), and [`Error::UnknownTicketType`]
    /// for unregistered types.
    #[tracing::instrument(
        skip(self, request),
        fields(ticket_type = %request.ticket_type, biz_id = %request.bk_biz_id)
    )]
    pub async fn create_ticket(&self, request: CreateTicketRequest) -> Result<TicketId> {
        let builder = self.registry.get(request.ticket_type)?;
        builder.validate(&request.details)?;

        let mut ticket = Ticket::new(
            request.ticket_type,
            request.bk_biz_id,
            request.creator,
            request.remark,
            request.details,
        );
        ticket.config = TicketConfig {
            notify_channels: request.notify_channels,
            helpers: request.helpers,
            extra: Bag::new(),
        };

        let inventory = self.manager.context().inventory.clone();
        let patch = builder.patch_details(&ticket, inventory.as_ref()).await?;
        ticket.merge_details(&patch);

        let policy = self.flow_configs.resolve(
            ticket.ticket_type,
            ticket.biz_id,
            &ticket.cluster_ids(),
        )?;

        let mut descriptors = Vec::new();
        if policy.need_approval {
            descriptors.push(
                FlowDescriptor::new(FlowType::Approval, "approval")
                    .with_retry(RetryPolicy::None),
            );
        }
        if policy.need_confirm {
            descriptors.push(
                FlowDescriptor::new(FlowType::HumanConfirm, "confirm")
                    .with_retry(RetryPolicy::None),
            );
        }
        descriptors.extend(builder.flows(&ticket)?);

        let flows: Vec<Flow> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| Flow::new(ticket.id, u32::try_from(i).unwrap_or(u32::MAX), d))
            .collect();

        self.manager
            .context()
            .store
            .insert_ticket(&ticket, &flows)
            .await?;
        metrics::record_ticket_created(ticket.ticket_type.as_token());
        tracing::info!(ticket_id = %ticket.id, flows = flows.len(), "ticket created");

        if request.auto_execute {
            self.manager.run_next_flow(ticket.id).await?;
        }
        Ok(ticket.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_policy_defaults_to_both_gates() {
        let store = FlowConfigStore::new();
        let policy = store
            .resolve(TicketType::MysqlHaApply, BizId::new(3), &[])
            .unwrap();
        assert!(policy.need_approval);
        assert!(policy.need_confirm);
    }

    #[test]
    fn cluster_scope_beats_biz_and_platform() {
        let store = FlowConfigStore::new();
        store
            .put(FlowConfigRule {
                scope: ConfigScope::Platform,
                ticket_type: TicketType::MysqlHaFullBackup,
                need_approval: true,
                need_confirm: true,
                editable: true,
            })
            .unwrap();
        store
            .put(FlowConfigRule {
                scope: ConfigScope::Biz {
                    biz_id: BizId::new(3),
                },
                ticket_type: TicketType::MysqlHaFullBackup,
                need_approval: false,
                need_confirm: true,
                editable: true,
            })
            .unwrap();
        store
            .put(FlowConfigRule {
                scope: ConfigScope::Clusters {
                    cluster_ids: vec![ClusterId::new(125)],
                },
                ticket_type: TicketType::MysqlHaFullBackup,
                need_approval: false,
                need_confirm: false,
                editable: false,
            })
            .unwrap();

        let policy = store
            .resolve(
                TicketType::MysqlHaFullBackup,
                BizId::new(3),
                &[ClusterId::new(125)],
            )
            .unwrap();
        assert!(!policy.need_approval);
        assert!(!policy.need_confirm);

        // Without the cluster, the biz rule wins.
        let policy = store
            .resolve(TicketType::MysqlHaFullBackup, BizId::new(3), &[])
            .unwrap();
        assert!(!policy.need_approval);
        assert!(policy.need_confirm);

        // Other businesses fall back to platform.
        let policy = store
            .resolve(TicketType::MysqlHaFullBackup, BizId::new(7), &[])
            .unwrap();
        assert!(policy.need_approval);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = BuilderRegistry::new();
        assert!(matches!(
            registry.get(TicketType::MysqlChecksum),
            Err(Error::UnknownTicketType { .. })
        ));
    }
}
