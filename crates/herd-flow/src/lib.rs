//! # herd-flow
//!
//! Ticket and flow orchestration core for the herd database control plane.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Ticket pipelines**: Each change request decomposes into an ordered
//!   pipeline of stages executed strictly sequentially
//! - **Cluster mutex**: A serialisable operation ledger enforcing the
//!   exclusion matrix between concurrent tickets at cluster granularity
//! - **Human gates**: Approval, confirmation, and pause-with-lock-check
//!   stages that suspend without blocking a thread
//! - **Recurring maintenance**: A cron catalog whose jobs submit real
//!   tickets (rollback exercises, backup audits, failover drills)
//!
//! ## Core Concepts
//!
//! - **Ticket**: A user-facing unit of change work against the fleet
//! - **Flow**: One stage of a ticket's pipeline
//! - **Ledger**: The cluster operation record table, source of truth for the
//!   runtime mutex
//!
//! ## Guarantees
//!
//! - At most one flow per ticket is RUNNING at a time
//! - The conflict-scan-then-begin sequence is serialisable per cluster:
//!   of two concurrent conflicting starts, exactly one succeeds
//! - Ticket status is a pure function of flow statuses
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use herd_flow::builders::default_registry;
//! use herd_flow::error::Result;
//! use herd_flow::manager::FlowManager;
//! use herd_flow::registry::{CreateTicketRequest, FlowConfigStore, TicketService};
//! use herd_flow::testing;
//! use herd_flow::ticket::TicketType;
//!
//! # async fn demo() -> Result<()> {
//! let stage = testing::stage_context();
//! let manager = Arc::new(FlowManager::new(stage.context()));
//! let service = TicketService::new(
//!     default_registry(),
//!     Arc::new(FlowConfigStore::new()),
//!     Arc::clone(&manager),
//! );
//!
//! let ticket_id = service
//!     .create_ticket(CreateTicketRequest {
//!         ticket_type: TicketType::MysqlHaApply,
//!         bk_biz_id: 3.into(),
//!         details: serde_json::from_str(
//!             r#"{"spec": "SA2.SMALL4", "domains": [{"key": "kio"}]}"#,
//!         )
//!         .unwrap(),
//!         creator: "alice".into(),
//!         remark: "new cluster for kio".into(),
//!         auto_execute: true,
//!         helpers: vec![],
//!         notify_channels: vec![],
//!     })
//!     .await?;
//! let summary = manager.summary(ticket_id).await?;
//! println!("{summary:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod alarm;
pub mod bag;
pub mod builders;
pub mod config;
pub mod drill;
pub mod error;
pub mod exclusion;
pub mod external;
pub mod flow;
pub mod ledger;
pub mod manager;
pub mod metrics;
pub mod recycle;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod testing;
pub mod ticket;
pub mod todo;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bag::Bag;
    pub use crate::config::{EngineConfig, PollConfig};
    pub use crate::error::{Error, ErrorCode, FlowError, Result};
    pub use crate::exclusion::{ExclusionMatrix, MatrixHandle};
    pub use crate::flow::{Flow, FlowDescriptor, FlowStatus, FlowType, RetryPolicy};
    pub use crate::ledger::{BeginOutcome, ConflictInfo, OperationLedger, RecordHandle, UnlockSet};
    pub use crate::manager::{
        ApprovalCallback, ApprovalResult, CallbackResult, ConfirmOutcome, FlowManager,
        TicketSummary, WorkflowCallback,
    };
    pub use crate::registry::{
        BuilderRegistry, CreateTicketRequest, FlowConfigStore, TicketBuilder, TicketService,
    };
    pub use crate::runner::{StageContext, StageOutcome, StageRunner};
    pub use crate::store::TicketStore;
    pub use crate::ticket::{Ticket, TicketStatus, TicketType};
    pub use crate::todo::{Todo, TodoStatus};
}
