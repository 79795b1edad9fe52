//! Strongly-typed identifiers used across the engine.
//!
//! `OrgId` scopes every ledger, FX and credit record; `TenantId` scopes usage
//! metering and billing subscriptions. Both are supplied by an external
//! resolution layer and never derived here.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Organization (ledger scope).
    OrgId,
    "OrgId"
);
uuid_newtype!(
    /// Billing tenant (usage/subscription scope).
    TenantId,
    "TenantId"
);
uuid_newtype!(
    /// Travel agency buying on credit.
    AgencyId,
    "AgencyId"
);
uuid_newtype!(AccountId, "AccountId");
uuid_newtype!(PostingId, "PostingId");
uuid_newtype!(EntryId, "EntryId");
uuid_newtype!(SnapshotId, "SnapshotId");
uuid_newtype!(UsageRecordId, "UsageRecordId");
uuid_newtype!(SubscriptionId, "SubscriptionId");
uuid_newtype!(RefundCaseId, "RefundCaseId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_through_display() {
        let id = OrgId::new();
        let parsed: OrgId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_error_names_the_type() {
        let err = "not-a-uuid".parse::<AgencyId>().unwrap_err();
        match err {
            DomainError::InvalidId(msg) => assert!(msg.starts_with("AgencyId")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
