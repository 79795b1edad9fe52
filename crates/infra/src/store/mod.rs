//! Store traits and their in-memory implementations.
//!
//! Every write that carries an idempotency key reports [`Inserted::Existing`]
//! on a unique-key collision instead of failing. Org/tenant ids are part of
//! every key, so a caller can only ever see its own rows.

pub mod billing;
pub mod credit;
pub mod finalize;
pub mod fx;
pub mod ledger;
pub mod usage;

use thiserror::Error;

use waypost_core::{DomainError, Outcome};

pub use billing::{
    Claim, InMemoryPaymentStore, InMemorySubscriptionStore, InMemoryWebhookEventStore, PaymentStore,
    SubscriptionStore, WebhookEventStore,
};
pub use credit::{CreditProfileStore, InMemoryCreditProfileStore};
pub use finalize::{FinalizeStore, InMemoryFinalizeStore};
pub use fx::{FxStore, InMemoryFxStore};
pub use ledger::{InMemoryLedgerStore, LedgerStore};
pub use usage::{InMemoryPlanStore, InMemoryUsageStore, PlanStore, UsageStore};

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted<T> {
    /// This call created the row.
    New(T),
    /// The key already existed; the stored row is returned unchanged.
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Inserted::New(v) | Inserted::Existing(v) => v,
        }
    }

    pub fn into_outcome(self) -> Outcome<T> {
        match self {
            Inserted::New(v) => Outcome::Applied(v),
            Inserted::Existing(v) => Outcome::AlreadyApplied(v),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional update lost against a concurrent writer.
    #[error("concurrent update: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::Corrupt(_) => "CORRUPT_ROW",
            StoreError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        StoreError::Storage(format!("{what} lock poisoned"))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
