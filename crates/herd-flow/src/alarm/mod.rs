//! Alarm-to-ticket adapter.
//!
//! Inbound alarm events arrive via a push callback. The adapter resolves the
//! affected cluster, applies the auto-fix allow-list and the per-business
//! ignore-domain list, groups faulty machines by role, and submits one
//! auto-fix ticket per group through the ordinary create-ticket contract.

pub mod watcher;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use herd_core::{BizId, TicketId};

use crate::bag::Bag;
use crate::error::{Error, Result};
use crate::external::{ClusterType, InstanceRole, InventoryRepository, Notifier};
use crate::metrics;
use crate::registry::{CreateTicketRequest, TicketService};
use crate::ticket::TicketType;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("alarm adapter lock poisoned")
}

/// One faulty machine reported by the alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultyMachine {
    /// Host address.
    pub host: String,
    /// Role of the machine within its cluster.
    pub role: InstanceRole,
}

/// The alarm payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmMessage {
    /// Domain of the affected cluster.
    pub domain: String,
    /// Faulty machines.
    pub machines: Vec<FaultyMachine>,
}

/// One inbound alarm event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    /// Who (or what) raised the alarm.
    pub creator: String,
    /// The payload.
    pub callback_message: AlarmMessage,
}

/// Disposition of one auto-fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutofixStatus {
    /// A ticket was submitted.
    AfSubmitted,
    /// The alarm was ignored (type not auto-fixable, domain ignored, ...).
    AfIgnore,
    /// Ticket creation failed.
    AfFail,
}

/// Record of one disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutofixRecord {
    /// The alarm's cluster domain.
    pub domain: String,
    /// Role group the record covers (absent for whole-alarm ignores).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<InstanceRole>,
    /// Disposition.
    pub status: AutofixStatus,
    /// The created ticket, when submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    /// Why the alarm was ignored or the submission failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the disposition was made.
    pub at: DateTime<Utc>,
}

/// Converts inbound alarms into auto-fix tickets.
pub struct AlarmAdapter {
    inventory: Arc<dyn InventoryRepository>,
    service: Arc<TicketService>,
    notifier: Arc<dyn Notifier>,
    allow_list: Vec<ClusterType>,
    notify_channels: Vec<String>,
    ignore_domains: RwLock<HashMap<BizId, BTreeSet<String>>>,
    records: RwLock<Vec<AutofixRecord>>,
}

impl std::fmt::Debug for AlarmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmAdapter").finish_non_exhaustive()
    }
}

impl AlarmAdapter {
    /// Creates an adapter. `allow_list` names the cluster families eligible
    /// for auto-fix.
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryRepository>,
        service: Arc<TicketService>,
        notifier: Arc<dyn Notifier>,
        allow_list: Vec<ClusterType>,
        notify_channels: Vec<String>,
    ) -> Self {
        Self {
            inventory,
            service,
            notifier,
            allow_list,
            notify_channels,
            ignore_domains: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Adds a domain to a business's ignore list.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn ignore_domain(&self, biz_id: BizId, domain: &str) -> Result<()> {
        let mut map = self.ignore_domains.write().map_err(poison_err)?;
        map.entry(biz_id).or_default().insert(domain.to_owned());
        Ok(())
    }

    /// Returns the dispositions recorded so far.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn records(&self) -> Result<Vec<AutofixRecord>> {
        let records = self.records.read().map_err(poison_err)?;
        Ok(records.clone())
    }

    fn push_record(&self, record: AutofixRecord) -> Result<()> {
        metrics::record_alarm_disposition(match record.status {
            AutofixStatus::AfSubmitted => "AF_SUBMITTED",
            AutofixStatus::AfIgnore => "AF_IGNORE",
            AutofixStatus::AfFail => "AF_FAIL",
        });
        let mut records = self.records.write().map_err(poison_err)?;
        records.push(record);
        Ok(())
    }

    fn is_ignored(&self, biz_id: BizId, domain: &str) -> Result<bool> {
        let map = self.ignore_domains.read().map_err(poison_err)?;
        Ok(map.get(&biz_id).is_some_and(|set| set.contains(domain)))
    }

    const fn autofix_type(cluster_type: ClusterType) -> Option<TicketType> {
        match cluster_type {
            ClusterType::RedisCluster => Some(TicketType::RedisClusterAutofix),
            ClusterType::MongoCluster => Some(TicketType::MongodbAutofix),
            ClusterType::TendbHa | ClusterType::TendbCluster => None,
        }
    }

    /// Handles one alarm event, returning the dispositions it produced.
    ///
    /// # Errors
    ///
    /// Returns an error on inventory or notifier failure; ticket-creation
    /// failures are recorded as `AF_FAIL` dispositions instead.
    #[tracing::instrument(skip(self, event), fields(domain = %event.callback_message.domain))]
    pub async fn handle(&self, event: &AlarmEvent) -> Result<Vec<AutofixRecord>> {
        let domain = &event.callback_message.domain;
        let mut produced = Vec::new();

        let ignore = |reason: String| AutofixRecord {
            domain: domain.clone(),
            role: None,
            status: AutofixStatus::AfIgnore,
            ticket_id: None,
            reason: Some(reason),
            at: Utc::now(),
        };

        // 1. Resolve the cluster and check the allow-list.
        let Some(cluster) = self.inventory.cluster_by_domain(domain).await? else {
            let record = ignore(format!("unknown domain {domain}"));
            self.push_record(record.clone())?;
            produced.push(record);
            return Ok(produced);
        };
        let Some(ticket_type) = Self::autofix_type(cluster.cluster_type)
            .filter(|_| self.allow_list.contains(&cluster.cluster_type))
        else {
            let record = ignore(format!(
                "cluster type {} not in the auto-fix allow-list",
                cluster.cluster_type
            ));
            self.push_record(record.clone())?;
            produced.push(record);
            return Ok(produced);
        };

        // 2. Per-business ignore-domain list.
        if self.is_ignored(cluster.biz_id, domain)? {
            if !self.notify_channels.is_empty() {
                self.notifier
                    .send(
                        "alarm ignored",
                        &format!("alarm on {domain} ignored (domain on the ignore list)"),
                        &self.notify_channels,
                    )
                    .await?;
            }
            let record = ignore("domain on the ignore list".to_owned());
            self.push_record(record.clone())?;
            produced.push(record);
            return Ok(produced);
        }

        // 3. Group by role and submit one ticket per group.
        let mut by_role: BTreeMap<InstanceRole, Vec<String>> = BTreeMap::new();
        for machine in &event.callback_message.machines {
            by_role
                .entry(machine.role)
                .or_default()
                .push(machine.host.clone());
        }

        for (role, hosts) in by_role {
            let mut details = Bag::new();
            details.insert("cluster_ids".into(), json!([cluster.id.as_u64()]));
            details.insert("role".into(), serde_json::to_value(role).unwrap_or_default());
            details.insert("hosts".into(), json!(hosts));

            let record = match self
                .service
                .create_ticket(CreateTicketRequest {
                    ticket_type,
                    bk_biz_id: cluster.biz_id,
                    details,
                    creator: event.creator.clone(),
                    remark: format!("auto-fix for alarm on {domain}"),
                    auto_execute: true,
                    helpers: vec![],
                    notify_channels: self.notify_channels.clone(),
                })
                .await
            {
                Ok(ticket_id) => AutofixRecord {
                    domain: domain.clone(),
                    role: Some(role),
                    status: AutofixStatus::AfSubmitted,
                    ticket_id: Some(ticket_id),
                    reason: None,
                    at: Utc::now(),
                },
                Err(e) => AutofixRecord {
                    domain: domain.clone(),
                    role: Some(role),
                    status: AutofixStatus::AfFail,
                    ticket_id: None,
                    reason: Some(e.to_string()),
                    at: Utc::now(),
                },
            };
            self.push_record(record.clone())?;
            produced.push(record);
        }

        Ok(produced)
    }
}
