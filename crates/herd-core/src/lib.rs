//! # herd-core
//!
//! Shared foundation for the herd control plane: strongly-typed entity
//! identifiers and the core error type.
//!
//! Identifiers come in two families:
//!
//! - **ULID-backed** ids minted by the control plane itself (tickets, flows,
//!   todos, drill reports). Lexicographically sortable by creation time and
//!   globally unique without coordination.
//! - **Numeric** ids assigned by the inventory system (clusters, businesses).
//!   The control plane never mints these; it only carries them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::{BizId, ClusterId, DrillId, FlowId, InstanceId, TicketId, TodoId};
