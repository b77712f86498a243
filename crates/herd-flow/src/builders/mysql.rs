//! Builders for relational HA ticket types.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::bag::{self, Bag};
use crate::error::{Error, Result};
use crate::external::InventoryRepository;
use crate::flow::{Flow, FlowDescriptor, FlowType, RetryPolicy};
use crate::registry::{RecyclePlan, TicketBuilder};
use crate::ticket::{Ticket, TicketStatus, TicketType};

use super::{allocated_resources, resolve_cluster_domains};

fn validation_err(ticket_type: TicketType, e: &Error) -> Error {
    Error::validation(ticket_type.to_string(), e.to_string())
}

#[derive(Debug, Deserialize)]
struct DomainSpec {
    key: String,
}

#[derive(Debug, Deserialize)]
struct HaApplyDetails {
    spec: String,
    domains: Vec<DomainSpec>,
    #[serde(default)]
    city: Option<String>,
}

/// `MYSQL_HA_APPLY`: deploy a relational primary/secondary pair.
#[derive(Debug, Default)]
pub struct MysqlHaApplyBuilder;

#[async_trait]
impl TicketBuilder for MysqlHaApplyBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlHaApply
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: HaApplyDetails =
            bag::from_bag(details).map_err(|e| validation_err(self.ticket_type(), &e))?;
        if parsed.spec.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "spec must not be empty",
            ));
        }
        if parsed.domains.is_empty() || parsed.domains.iter().any(|d| d.key.is_empty()) {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "at least one non-empty domain key is required",
            ));
        }
        let _ = parsed.city;
        Ok(())
    }

    async fn patch_details(
        &self,
        _ticket: &Ticket,
        _inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        // Apply tickets create their clusters; nothing to resolve yet.
        Ok(Bag::new())
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let mut apply_details = Bag::new();
        apply_details.insert("action".into(), json!("mysql_ha_apply"));
        Ok(vec![
            FlowDescriptor::new(FlowType::InnerWorkflow, "apply")
                .with_retry(RetryPolicy::Manual)
                .with_details(apply_details),
            FlowDescriptor::new(FlowType::Delivery, "delivery"),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct ClusterListDetails {
    cluster_ids: Vec<u64>,
}

fn validate_cluster_list(ticket_type: TicketType, details: &Bag) -> Result<()> {
    let parsed: ClusterListDetails =
        bag::from_bag(details).map_err(|e| validation_err(ticket_type, &e))?;
    if parsed.cluster_ids.is_empty() {
        return Err(Error::validation(
            ticket_type.to_string(),
            "cluster_ids must not be empty",
        ));
    }
    Ok(())
}

/// `MYSQL_MASTER_SLAVE_SWITCH`: planned primary/secondary switch.
#[derive(Debug, Default)]
pub struct MysqlMasterSlaveSwitchBuilder;

#[async_trait]
impl TicketBuilder for MysqlMasterSlaveSwitchBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlMasterSlaveSwitch
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        validate_cluster_list(self.ticket_type(), details)
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let mut details = Bag::new();
        details.insert("action".into(), json!("mysql_master_slave_switch"));
        Ok(vec![FlowDescriptor::new(
            FlowType::InnerWorkflow,
            "master slave switch",
        )
        .with_details(details)])
    }
}

#[derive(Debug, Deserialize)]
struct FullBackupDetails {
    cluster_ids: Vec<u64>,
    #[serde(default)]
    backup_type: Option<String>,
}

/// `MYSQL_HA_FULL_BACKUP`: full backup of a relational HA cluster.
#[derive(Debug, Default)]
pub struct MysqlHaFullBackupBuilder;

#[async_trait]
impl TicketBuilder for MysqlHaFullBackupBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlHaFullBackup
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: FullBackupDetails =
            bag::from_bag(details).map_err(|e| validation_err(self.ticket_type(), &e))?;
        if parsed.cluster_ids.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "cluster_ids must not be empty",
            ));
        }
        Ok(())
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        let mut patch = resolve_cluster_domains(ticket, inventory).await?;
        if bag::get_str(&ticket.details, "backup_type").is_none() {
            patch.insert("backup_type".into(), json!("logical"));
        }
        Ok(patch)
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let mut details = Bag::new();
        details.insert("action".into(), json!("mysql_ha_full_backup"));
        Ok(vec![FlowDescriptor::new(
            FlowType::InnerWorkflow,
            "full backup",
        )
        .with_retry(RetryPolicy::AutoOnTransient)
        .with_details(details)])
    }
}

/// `MYSQL_PROXY_SWITCH`: replace a proxy in front of a cluster.
#[derive(Debug, Default)]
pub struct MysqlProxySwitchBuilder;

#[async_trait]
impl TicketBuilder for MysqlProxySwitchBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlProxySwitch
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        validate_cluster_list(self.ticket_type(), details)
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let mut details = Bag::new();
        details.insert("action".into(), json!("mysql_proxy_switch"));
        Ok(vec![FlowDescriptor::new(
            FlowType::InnerWorkflow,
            "proxy switch",
        )
        .with_details(details)])
    }
}

#[derive(Debug, Deserialize)]
struct MigrateDetails {
    cluster_ids: Vec<u64>,
    spec: String,
    #[serde(default = "default_host_count")]
    count: u32,
    #[serde(default)]
    city: Option<String>,
}

const fn default_host_count() -> u32 {
    2
}

/// `MYSQL_MIGRATE_CLUSTER`: migrate a relational cluster onto new hosts.
///
/// The long-running composite: migrate data under an unlock window for proxy
/// switches, then hold a PAUSE gate (re-engaging the mutex for that type)
/// before the cutover.
#[derive(Debug, Default)]
pub struct MysqlMigrateClusterBuilder;

#[async_trait]
impl TicketBuilder for MysqlMigrateClusterBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlMigrateCluster
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: MigrateDetails =
            bag::from_bag(details).map_err(|e| validation_err(self.ticket_type(), &e))?;
        if parsed.cluster_ids.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "cluster_ids must not be empty",
            ));
        }
        if parsed.spec.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "spec must not be empty",
            ));
        }
        if parsed.count == 0 {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "count must be positive",
            ));
        }
        Ok(())
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let parsed: MigrateDetails = bag::from_bag(&ticket.details)?;

        let mut resource_details = Bag::new();
        resource_details.insert("spec".into(), json!(parsed.spec));
        resource_details.insert("count".into(), json!(parsed.count));
        if let Some(city) = parsed.city {
            resource_details.insert("city".into(), json!(city));
        }

        let mut migrate_details = Bag::new();
        migrate_details.insert("action".into(), json!("mysql_migrate_data"));
        migrate_details.insert(
            "unlock_ticket_types".into(),
            json!([TicketType::MysqlProxySwitch.as_token()]),
        );

        let mut pause_details = Bag::new();
        pause_details.insert(
            crate::runner::pause::RELEASE_UNLOCK_KEY.into(),
            json!([TicketType::MysqlProxySwitch.as_token()]),
        );

        let mut cutover_details = Bag::new();
        cutover_details.insert("action".into(), json!("mysql_migrate_cutover"));

        Ok(vec![
            FlowDescriptor::new(FlowType::ResourceApply, "apply resources")
                .with_details(resource_details),
            FlowDescriptor::new(FlowType::InnerWorkflow, "migrate data")
                .with_retry(RetryPolicy::AutoOnTransient)
                .with_details(migrate_details),
            FlowDescriptor::new(FlowType::PauseWithLockCheck, "cutover confirm")
                .with_details(pause_details),
            FlowDescriptor::new(FlowType::InnerWorkflow, "cutover")
                .with_details(cutover_details),
            FlowDescriptor::new(FlowType::Delivery, "delivery"),
        ])
    }

    fn recycle(&self, ticket: &Ticket, flows: &[Flow]) -> Option<RecyclePlan> {
        recycle_allocated_hosts(ticket, flows)
    }
}

#[derive(Debug, Deserialize)]
struct RollbackDetails {
    cluster_ids: Vec<u64>,
    spec: String,
    #[serde(default = "default_host_count")]
    count: u32,
    #[serde(default)]
    rollback_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// `MYSQL_ROLLBACK_CLUSTER`: roll a cluster back to a point in time on
/// scratch hosts. Submitted routinely by the rollback-exercise job.
#[derive(Debug, Default)]
pub struct MysqlRollbackClusterBuilder;

#[async_trait]
impl TicketBuilder for MysqlRollbackClusterBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::MysqlRollbackCluster
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: RollbackDetails =
            bag::from_bag(details).map_err(|e| validation_err(self.ticket_type(), &e))?;
        if parsed.cluster_ids.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "cluster_ids must not be empty",
            ));
        }
        if parsed.spec.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "spec must not be empty",
            ));
        }
        let _ = (parsed.count, parsed.rollback_time);
        Ok(())
    }

    async fn patch_details(
        &self,
        ticket: &Ticket,
        inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        resolve_cluster_domains(ticket, inventory).await
    }

    fn flows(&self, ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let parsed: RollbackDetails = bag::from_bag(&ticket.details)?;

        let mut resource_details = Bag::new();
        resource_details.insert("spec".into(), json!(parsed.spec));
        resource_details.insert("count".into(), json!(parsed.count));

        let mut rollback_details = Bag::new();
        rollback_details.insert("action".into(), json!("mysql_rollback_to_scratch"));

        Ok(vec![
            FlowDescriptor::new(FlowType::ResourceApply, "apply resources")
                .with_details(resource_details),
            FlowDescriptor::new(FlowType::InnerWorkflow, "rollback to scratch cluster")
                .with_retry(RetryPolicy::AutoOnTransient)
                .with_details(rollback_details),
            FlowDescriptor::new(FlowType::Delivery, "delivery"),
        ])
    }

    fn recycle(&self, ticket: &Ticket, flows: &[Flow]) -> Option<RecyclePlan> {
        recycle_allocated_hosts(ticket, flows)
    }
}

/// Shared recycling policy: a failed or terminated ticket that allocated
/// hosts spawns a return-to-pool child carrying the parent id and the hosts.
fn recycle_allocated_hosts(ticket: &Ticket, flows: &[Flow]) -> Option<RecyclePlan> {
    if !matches!(
        ticket.status,
        TicketStatus::Failed | TicketStatus::Terminated
    ) {
        return None;
    }
    let (hosts, request_ids) = allocated_resources(flows);
    if hosts.is_empty() {
        return None;
    }

    let mut details = Bag::new();
    details.insert("parent_ticket_id".into(), json!(ticket.id.to_string()));
    details.insert("hosts".into(), serde_json::Value::Array(hosts));
    if let Some(request_id) = request_ids.first() {
        details.insert("request_id".into(), json!(request_id));
    }
    Some(RecyclePlan {
        ticket_type: TicketType::ResourceReturn,
        details,
        remark: format!("return hosts of failed ticket {}", ticket.id),
    })
}
