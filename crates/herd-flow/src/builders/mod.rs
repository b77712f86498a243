//! Concrete ticket builders.
//!
//! One builder per registered ticket type. Each carries a typed details
//! struct (the validated form of the schemaless bag), a patcher that
//! resolves inventory data, and a pipeline factory. Policy gates (APPROVAL,
//! HUMAN-CONFIRM) are *not* emitted here — the service prepends them per
//! flow-config.

mod autofix;
mod drill;
mod mysql;
mod resource;

pub use autofix::{MongodbAutofixBuilder, RedisClusterAutofixBuilder};
pub use drill::FailoverDrillBuilder;
pub use mysql::{
    MysqlHaApplyBuilder, MysqlHaFullBackupBuilder, MysqlMasterSlaveSwitchBuilder,
    MysqlMigrateClusterBuilder, MysqlProxySwitchBuilder, MysqlRollbackClusterBuilder,
};
pub use resource::ResourceReturnBuilder;

use std::sync::Arc;

use serde_json::json;

use crate::bag::Bag;
use crate::error::{Error, Result};
use crate::external::InventoryRepository;
use crate::flow::Flow;
use crate::registry::BuilderRegistry;
use crate::runner::resource::{HOSTS_KEY, RESOURCE_REQUEST_KEY};
use crate::ticket::Ticket;

/// Builds the registry with every builder this core ships.
#[must_use]
pub fn default_registry() -> BuilderRegistry {
    let mut registry = BuilderRegistry::new();
    registry.register(Arc::new(MysqlHaApplyBuilder));
    registry.register(Arc::new(MysqlHaFullBackupBuilder));
    registry.register(Arc::new(MysqlMasterSlaveSwitchBuilder));
    registry.register(Arc::new(MysqlProxySwitchBuilder));
    registry.register(Arc::new(MysqlMigrateClusterBuilder));
    registry.register(Arc::new(MysqlRollbackClusterBuilder));
    registry.register(Arc::new(RedisClusterAutofixBuilder));
    registry.register(Arc::new(MongodbAutofixBuilder));
    registry.register(Arc::new(ResourceReturnBuilder));
    registry.register(Arc::new(FailoverDrillBuilder));
    registry
}

/// Resolves the domains of a ticket's clusters into a `cluster_domains`
/// patch (`id -> domain`), verifying every cluster exists.
pub(crate) async fn resolve_cluster_domains(
    ticket: &Ticket,
    inventory: &dyn InventoryRepository,
) -> Result<Bag> {
    let mut domains = serde_json::Map::new();
    for cluster_id in ticket.cluster_ids() {
        let meta = inventory
            .cluster(cluster_id)
            .await?
            .ok_or_else(|| Error::validation(
                ticket.ticket_type.to_string(),
                format!("cluster {cluster_id} not found in inventory"),
            ))?;
        domains.insert(cluster_id.to_string(), json!(meta.domain));
    }
    let mut patch = Bag::new();
    patch.insert("cluster_domains".into(), serde_json::Value::Object(domains));
    Ok(patch)
}

/// Collects the hosts allocated by resource stages of a finished ticket,
/// plus the broker request ids, for recycling.
#[must_use]
pub(crate) fn allocated_resources(flows: &[Flow]) -> (Vec<serde_json::Value>, Vec<String>) {
    let mut hosts = Vec::new();
    let mut request_ids = Vec::new();
    for flow in flows {
        if let Some(list) = flow.context.get(HOSTS_KEY).and_then(|v| v.as_array()) {
            hosts.extend(list.iter().cloned());
        }
        match flow.context.get(RESOURCE_REQUEST_KEY) {
            Some(serde_json::Value::String(id)) if !id.is_empty() => {
                request_ids.push(id.clone());
            }
            Some(serde_json::Value::Array(ids)) => {
                request_ids.extend(
                    ids.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned)),
                );
            }
            _ => {}
        }
    }
    (hosts, request_ids)
}
