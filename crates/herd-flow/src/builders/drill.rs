//! Builder for the failover-drill fault-injection ticket.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::bag::{self, Bag};
use crate::error::{Error, Result};
use crate::external::InventoryRepository;
use crate::flow::{FlowDescriptor, FlowType, RetryPolicy};
use crate::registry::TicketBuilder;
use crate::ticket::{Ticket, TicketType};

use super::resolve_cluster_domains;

#[derive(Debug, Deserialize)]
struct DrillDetails {
    cluster_ids: Vec<u64>,
    #[serde(default)]
    target_host: Option<String>,
}

/// `FAILOVER_DRILL`: inject a fault into a drill cluster so the HA daemon's
/// switch machinery can be exercised. Submitted by the drill orchestrators.
#[derive(Debug, Default)]
pub struct FailoverDrillBuilder;

#[async_trait]
impl TicketBuilder for FailoverDrillBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::FailoverDrill
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: DrillDetails = bag::from_bag(details)
            .map_err(|e| Error::validation(self.ticket_type().to_string(), e.to_string()))?;
        if parsed.cluster_ids.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "cluster_ids must not be empty",
            ));
        }
        let _ = parsed.target_host;
        Ok(())
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
        details.insert("action".into(), json!("failover_drill_inject"));
        Ok(vec![FlowDescriptor::new(
            FlowType::InnerWorkflow,
            "inject failure",
        )
        .with_retry(RetryPolicy::Manual)
        .with_details(details)])
    }
}
