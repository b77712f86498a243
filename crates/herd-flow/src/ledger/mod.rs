//! Cluster operation ledger: the runtime mutex between tickets.
//!
//! The ledger is the source of truth for "which (cluster, flow, ticket)
//! triples are active". A record exists while its flow is RUNNING or FAILED;
//! records answer the question "does a new candidate ticket conflict here?"
//!
//! ## Serialisability
//!
//! The conflict-scan-then-insert sequence is the classic check-then-insert
//! race. The contract therefore exposes it as **one atomic operation**:
//! [`OperationLedger::begin_all`] scans every cluster the ticket touches and
//! inserts all records — or none — under a guarantee that is serialisable
//! with respect to other `begin_all` calls touching any of the same
//! clusters. Implementations must take their locks in a deterministic order
//! (ascending cluster id) when the lock is not global.
//!
//! ## Unlock sets
//!
//! Each record carries a set of ticket-type tokens that do **not** conflict
//! with it, with `"*"` as a wildcard. This is the escape hatch composite
//! workflows use to declare "during this window, type T may interleave".

pub mod memory;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{ClusterId, FlowId, TicketId};

use crate::error::Result;
use crate::ticket::TicketType;

/// The wildcard unlock token: nothing conflicts with the record.
pub const UNLOCK_WILDCARD: &str = "*";

/// Per-record set of ticket types that do not conflict with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnlockSet(BTreeSet<String>);

impl UnlockSet {
    /// Creates an empty unlock set: everything conflicts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from type tokens.
    #[must_use]
    pub fn from_tokens(tokens: impl IntoIterator<Item = String>) -> Self {
        Self(tokens.into_iter().collect())
    }

    /// Creates the wildcard set: nothing conflicts.
    #[must_use]
    pub fn wildcard() -> Self {
        let mut set = BTreeSet::new();
        set.insert(UNLOCK_WILDCARD.to_owned());
        Self(set)
    }

    /// Returns true if the set covers `candidate` (exact token or wildcard).
    #[must_use]
    pub fn covers(&self, candidate: TicketType) -> bool {
        self.0.contains(UNLOCK_WILDCARD) || self.0.contains(candidate.as_token())
    }

    /// Appends tokens to the set.
    pub fn extend_tokens(&mut self, tokens: &[String]) {
        for token in tokens {
            self.0.insert(token.clone());
        }
    }

    /// Removes tokens from the set.
    pub fn retract_tokens(&mut self, tokens: &[String]) {
        for token in tokens {
            self.0.remove(token);
        }
    }

    /// Returns the tokens in the set.
    #[must_use]
    pub fn tokens(&self) -> &BTreeSet<String> {
        &self.0
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Identity of a ledger record: unique on (cluster, flow, ticket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordHandle {
    /// Cluster the record locks.
    pub cluster_id: ClusterId,
    /// Flow holding the lock.
    pub flow_id: FlowId,
    /// Ticket owning the flow.
    pub ticket_id: TicketId,
}

/// One row in the operation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Cluster the record locks.
    pub cluster_id: ClusterId,
    /// Flow holding the lock.
    pub flow_id: FlowId,
    /// Ticket owning the flow.
    pub ticket_id: TicketId,
    /// Type of the owning ticket.
    pub ticket_type: TicketType,
    /// Candidate types that do not conflict with this record.
    pub unlock: UnlockSet,
    /// Set while the owning flow waits at a PAUSE gate.
    pub is_paused: bool,
    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Returns this record's handle.
    #[must_use]
    pub const fn handle(&self) -> RecordHandle {
        RecordHandle {
            cluster_id: self.cluster_id,
            flow_id: self.flow_id,
            ticket_id: self.ticket_id,
        }
    }
}

/// A conflicting record, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    /// Cluster on which the conflict occurs.
    pub cluster_id: ClusterId,
    /// The conflicting ticket.
    pub ticket_id: TicketId,
    /// Its type.
    pub ticket_type: TicketType,
    /// The flow holding the record.
    pub flow_id: FlowId,
}

/// Outcome of the atomic scan-then-insert.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// No conflicts; all records were inserted.
    Started(Vec<RecordHandle>),
    /// At least one conflict; nothing was inserted.
    Conflicted(Vec<ConflictInfo>),
}

impl BeginOutcome {
    /// Returns true if records were inserted.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// The cluster operation ledger contract.
///
/// All reads used for admission control are executed under the same
/// synchronisation that covers concurrent inserts for the same cluster, so
/// concurrent attempts to start conflicting flows see one succeed and one
/// fail.
#[async_trait]
pub trait OperationLedger: Send + Sync {
    /// Inserts a record. Idempotent on (cluster, flow, ticket).
    async fn begin(
        &self,
        cluster_id: ClusterId,
        flow_id: FlowId,
        ticket_id: TicketId,
        ticket_type: TicketType,
        unlock: UnlockSet,
    ) -> Result<RecordHandle>;

    /// Atomically scans every cluster for conflicts with `ticket_type`
    /// (excluding tickets in `exclude`), and inserts one record per cluster
    /// if — and only if — no cluster conflicts.
    async fn begin_all(
        &self,
        cluster_ids: &[ClusterId],
        flow_id: FlowId,
        ticket_id: TicketId,
        ticket_type: TicketType,
        unlock: UnlockSet,
        exclude: &[TicketId],
    ) -> Result<BeginOutcome>;

    /// Deletes a record. Deleting a missing record is a no-op.
    async fn end(&self, handle: &RecordHandle) -> Result<()>;

    /// Deletes every record held by a flow.
    async fn end_all_for_flow(&self, flow_id: FlowId) -> Result<()>;

    /// Sets or clears the paused flag on a record.
    async fn mark_paused(&self, handle: &RecordHandle, paused: bool) -> Result<()>;

    /// Returns all records on `cluster_id` that conflict with a candidate of
    /// `candidate` type: the record's unlock set does not cover the
    /// candidate, its ticket is not excluded, and the exclusion matrix marks
    /// the pair exclusive.
    async fn conflicts(
        &self,
        cluster_id: ClusterId,
        candidate: TicketType,
        exclude: &[TicketId],
    ) -> Result<Vec<ConflictInfo>>;

    /// The PAUSE-gate variant of [`conflicts`](Self::conflicts): re-runs the
    /// scan for the record's own cluster and ticket type, excluding paused
    /// records and the record's own ticket, so two tickets paused at the
    /// same gate do not deadlock each other.
    async fn conflicts_for_pause(&self, handle: &RecordHandle) -> Result<Vec<ConflictInfo>>;

    /// Appends tokens to a record's unlock set.
    async fn extend_unlock(&self, handle: &RecordHandle, tokens: &[String]) -> Result<()>;

    /// Removes tokens from a record's unlock set.
    async fn retract_unlock(&self, handle: &RecordHandle, tokens: &[String]) -> Result<()>;

    /// Returns every record held by a ticket.
    async fn records_for_ticket(&self, ticket_id: TicketId) -> Result<Vec<OperationRecord>>;

    /// Returns every record on a cluster.
    async fn records_for_cluster(&self, cluster_id: ClusterId) -> Result<Vec<OperationRecord>>;

    /// Startup recovery: deletes every record whose flow is not in
    /// `live_flows` (i.e. no longer RUNNING or FAILED). Returns the number
    /// of records removed.
    async fn sweep(&self, live_flows: &HashSet<FlowId>) -> Result<usize>;
}
