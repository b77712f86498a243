//! Strongly-typed identifiers for herd entities.
//!
//! All control-plane-minted identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Inventory-assigned identifiers ([`ClusterId`], [`BizId`]) are plain numeric
//! newtypes; herd carries them but never generates them.
//!
//! # Example
//!
//! ```rust
//! use herd_core::id::{FlowId, TicketId};
//!
//! let ticket = TicketId::generate();
//! let flow = FlowId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TicketId = flow;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
                chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a ticket.
    ///
    /// Tickets are the user-facing unit of change work against the fleet.
    TicketId,
    "ticket"
);

ulid_id!(
    /// A unique identifier for a flow (one stage of a ticket's pipeline).
    FlowId,
    "flow"
);

ulid_id!(
    /// A unique identifier for a todo (a human action item on a flow).
    TodoId,
    "todo"
);

ulid_id!(
    /// A unique identifier for a drill report.
    DrillId,
    "drill"
);

ulid_id!(
    /// A unique identifier for one firing of a recurring task.
    InstanceId,
    "instance"
);

/// An inventory-assigned cluster identifier.
///
/// Clusters are managed database deployments; their ids are allocated by the
/// inventory system, never by herd.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl ClusterId {
    /// Creates a cluster id from its raw numeric form.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClusterId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// An inventory-assigned business (tenant) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BizId(pub u64);

impl BizId {
    /// Creates a business id from its raw numeric form.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BizId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BizId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_roundtrip() {
        let id = TicketId::generate();
        let s = id.to_string();
        let parsed: TicketId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn flow_id_roundtrip() {
        let id = FlowId::generate();
        let s = id.to_string();
        let parsed: FlowId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let id1 = TicketId::generate();
        let id2 = TicketId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<TicketId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn cluster_id_display_is_numeric() {
        assert_eq!(ClusterId::new(125).to_string(), "125");
    }

    #[test]
    fn cluster_id_serde_is_transparent() {
        let id = ClusterId::new(125);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "125");
    }
}
