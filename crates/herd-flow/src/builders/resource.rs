//! Builder for the resource-return follow-up ticket.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::bag::{self, Bag};
use crate::error::{Error, Result};
use crate::external::InventoryRepository;
use crate::flow::{FlowDescriptor, FlowType, RetryPolicy};
use crate::registry::TicketBuilder;
use crate::ticket::{Ticket, TicketType};

#[derive(Debug, Deserialize)]
struct ReturnDetails {
    parent_ticket_id: String,
    hosts: Vec<serde_json::Value>,
    #[serde(default)]
    request_id: Option<String>,
}

/// `RESOURCE_RETURN`: hand allocated hosts back to the resource pool.
///
/// Spawned by the recycle dispatcher; the details carry the parent ticket id
/// and the host list, keeping the cross-ticket reference id-only.
#[derive(Debug, Default)]
pub struct ResourceReturnBuilder;

#[async_trait]
impl TicketBuilder for ResourceReturnBuilder {
    fn ticket_type(&self) -> TicketType {
        TicketType::ResourceReturn
    }

    fn validate(&self, details: &Bag) -> Result<()> {
        let parsed: ReturnDetails = bag::from_bag(details)
            .map_err(|e| Error::validation(self.ticket_type().to_string(), e.to_string()))?;
        if parsed.parent_ticket_id.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "parent_ticket_id must not be empty",
            ));
        }
        if parsed.hosts.is_empty() {
            return Err(Error::validation(
                self.ticket_type().to_string(),
                "hosts must not be empty",
            ));
        }
        let _ = parsed.request_id;
        Ok(())
    }

    async fn patch_details(
        &self,
        _ticket: &Ticket,
        _inventory: &dyn InventoryRepository,
    ) -> Result<Bag> {
        Ok(Bag::new())
    }

    fn flows(&self, _ticket: &Ticket) -> Result<Vec<FlowDescriptor>> {
        let mut details = Bag::new();
        details.insert("action".into(), json!("resource_return"));
        Ok(vec![FlowDescriptor::new(
            FlowType::InnerWorkflow,
            "return to resource pool",
        )
        .with_retry(RetryPolicy::AutoOnTransient)
        .with_details(details)])
    }
}
