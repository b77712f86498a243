//! Builders for alarm-driven auto-fix ticket types.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::bag::{self, Bag};
use crate::error::{Error, Result};
use crate::external::{InstanceRole, InventoryRepository};
use crate::flow::{FlowDescriptor, FlowType, RetryPolicy};
use crate::registry::TicketBuilder;
use crate::ticket::{Ticket, TicketType};

use super::resolve_cluster_domains;

#[derive(Debug, Deserialize)]
struct AutofixDetails {
    cluster_ids: Vec<u64>,
    role: InstanceRole,
    hosts: Vec<String>,
}

fn validate_autofix(ticket_type: TicketType, details: &Bag) -> Result<()> {
    let parsed: AutofixDetails = bag::from_bag(details)
        .map_err(|e| Error::validation(ticket_type.to_string(), e.to_string()))?;
    if parsed.cluster_ids.is_empty() {
        return Err(Error::validation(
            ticket_type.to_string(),
            "cluster_ids must not be empty",
        ));
    }
    if parsed.hosts.is_empty() {
        return Err(Error::validation(
            ticket_type.to_string(),
            "hosts must not be empty",
        ));
    }
    let _ = parsed.role;
    Ok(())
}

fn autofix_flow(action: &str) -> Vec<FlowDescriptor> {
    let mut details = Bag::new();
    details.insert("action".into(), json!(action));
    vec![FlowDescriptor::new(FlowType::InnerWorkflow, "autofix")
        .with_retry(RetryPolicy::AutoOnTransient)
        .with_details(details)]
}

/// `REDIS_CLUSTER_AUTOFIX`: automatic fault repair for a cache cluster.
#[derive(Debug, Default)]
pub struct RedisClusterAutofixBuilder;

#[async_trait]
impl TicketBuilder for RedisClusterAutofixBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::RedisClusterAutofix
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        validate_autofix(self.ticket_type(), details)
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        Ok(autofix_flow("redis_cluster_autofix"))
    }
}

/// `MONGODB_AUTOFIX`: automatic fault repair for a document-store cluster.
#[derive(Debug, Default)]
pub struct MongodbAutofixBuilder;

#[async_trait]
impl TicketBuilder for MongodbAutofixBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MongodbAutofix
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        validate_autofix(self.ticket_type(), details)
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        Ok(autofix_flow("mongodb_autofix"))
    }
}
