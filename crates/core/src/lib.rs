//! `waypost-core`: shared building blocks for the ledger & billing engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, money, idempotency outcomes and the aggregate contract.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod outcome;
pub mod reference;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    AccountId, AgencyId, EntryId, OrgId, PostingId, RefundCaseId, SnapshotId, SubscriptionId,
    TenantId, UsageRecordId,
};
pub use money::{Amount, Currency, round_money};
pub use outcome::{Outcome, Rejection, RejectionKind};
pub use reference::{ContextRef, SourceRef};
pub use value_object::ValueObject;
