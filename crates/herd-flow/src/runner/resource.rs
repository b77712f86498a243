//! RESOURCE-APPLY and RESOURCE-BATCH runners.
//!
//! Both call the resource broker and park the allocation in the flow
//! context; a later stage failure lets the recycle dispatcher return the
//! hosts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{StageContext, StageOutcome, StageRunner};
use crate::bag::{self, Bag};
use crate::error::{ErrorCode, FlowError, Result};
use crate::external::{ResourceApplyParams, ResourceBroker, ResourceResultCode};
use crate::flow::Flow;
use crate::store::TicketStore;
use crate::ticket::Ticket;

/// Context key holding the allocated hosts.
pub const HOSTS_KEY: &str = "hosts";
/// Context key holding the broker request id.
pub const RESOURCE_REQUEST_KEY: &str = "resource_request_id";

#[derive(Debug, Deserialize)]
struct ApplyDetails {
    spec: String,
    count: u32,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchDetails {
    groups: Vec<ApplyDetails>,
}

async fn apply_one(
    ctx: &StageContext,
    ticket: &Ticket,
    details: ApplyDetails,
) -> Result<std::result::Result<(Vec<serde_json::Value>, String), FlowError>> {
    let result = ctx
        .broker
        .apply(ResourceApplyParams {
            biz_id: ticket.biz_id,
            spec: details.spec,
            count: details.count,
            city: details.city,
            group: details.group,
        })
        .await?;

    match result.code {
        ResourceResultCode::Ok => {
            let hosts = result
                .hosts
                .iter()
                .map(|h| json!({"host": h.host, "cloudId": h.cloud_id, "spec": h.spec}))
                .collect();
            Ok(Ok((hosts, result.request_id)))
        }
        ResourceResultCode::ResourceLake => Ok(Err(FlowError::new(
            ErrorCode::ResourceLake,
            "resource pool cannot satisfy the request",
        ))),
        ResourceResultCode::Failed => Ok(Err(FlowError::new(
            ErrorCode::ResourceLake,
            "resource broker rejected the request",
        ))),
    }
}

/// Allocates one host group from the resource pool.
#[derive(Debug, Default)]
pub struct ResourceApplyRunner;

#[async_trait]
impl StageRunner for ResourceApplyRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let details: ApplyDetails = bag::from_bag(&flow.details)?;

        match apply_one(ctx, ticket, details).await? {
            Ok((hosts, request_id)) => {
                let mut patch = Bag::new();
                patch.insert(HOSTS_KEY.into(), serde_json::Value::Array(hosts));
                patch.insert(RESOURCE_REQUEST_KEY.into(), json!(request_id));
                ctx.store.merge_flow_context(flow.id, &patch).await?;
                Ok(StageOutcome::CompletedSuccess)
            }
            Err(err) => Ok(StageOutcome::CompletedFail(err)),
        }
    }
}

/// Allocates several host groups from the resource pool.
#[derive(Debug, Default)]
pub struct ResourceBatchRunner;

#[async_trait]
impl StageRunner for ResourceBatchRunner {
    #[tracing::instrument(skip(self, ctx, ticket, flow), fields(ticket_id = %ticket.id, flow_id = %flow.id))]
    async fn run(&self, ctx: &StageContext, ticket: &Ticket, flow: &Flow) -> Result<StageOutcome> {
        let details: BatchDetails = bag::from_bag(&flow.details)?;

        let mut all_hosts = Vec::new();
        let mut request_ids = Vec::new();
        for group in details.groups {
            match apply_one(ctx, ticket, group).await? {
                Ok((hosts, request_id)) => {
                    all_hosts.extend(hosts);
                    request_ids.push(json!(request_id));
                }
                Err(err) => return Ok(StageOutcome::CompletedFail(err)),
            }
        }

        let mut patch = Bag::new();
        patch.insert(HOSTS_KEY.into(), serde_json::Value::Array(all_hosts));
        patch.insert(
            RESOURCE_REQUEST_KEY.into(),
            serde_json::Value::Array(request_ids),
        );
        ctx.store.merge_flow_context(flow.id, &patch).await?;
        Ok(StageOutcome::CompletedSuccess)
    }
}
