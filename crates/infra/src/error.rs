use thiserror::Error;

use waypost_billing::BillingError;
use waypost_core::DomainError;
use waypost_credit::CreditError;
use waypost_fx::FxError;
use waypost_ledger::LedgerError;
use waypost_refunds::RefundError;

use crate::store::StoreError;

/// Error surface of the engine services. Wraps the domain errors so callers
/// can map them to stable codes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Fx(#[from] FxError),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("posting not found: {0}")]
    PostingNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Ledger(e) => e.code(),
            EngineError::Fx(e) => e.code(),
            EngineError::Credit(e) => e.code(),
            EngineError::Refund(e) => e.code(),
            EngineError::Billing(e) => e.code(),
            EngineError::PostingNotFound(_) => "POSTING_NOT_FOUND",
            EngineError::Store(e) => e.code(),
        }
    }

    /// Storage failures may succeed on retry; domain rejections will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Storage(_) | StoreError::Conflict(_)))
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        EngineError::Ledger(LedgerError::Domain(err))
    }
}
