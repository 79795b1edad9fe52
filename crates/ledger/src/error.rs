use rust_decimal::Decimal;
use thiserror::Error;

use waypost_core::{AccountId, Currency, DomainError};

/// Ledger validation failures. All are caller bugs and are raised before
/// any write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unbalanced posting in {currency}: debit {debit} != credit {credit}")]
    Unbalanced {
        currency: Currency,
        debit: Decimal,
        credit: Decimal,
    },

    #[error("posting must have at least one entry")]
    EmptyPosting,

    #[error("account {0} not found in this org")]
    AccountNotFound(AccountId),

    #[error("account {0} is archived")]
    AccountArchived(AccountId),

    #[error("account {account} holds {expected}, entry is in {found}")]
    CurrencyMismatch {
        account: AccountId,
        expected: Currency,
        found: Currency,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Unbalanced { .. } => "UNBALANCED_POSTING",
            LedgerError::EmptyPosting => "EMPTY_POSTING",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountArchived(_) => "ACCOUNT_ARCHIVED",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::Domain(_) => "VALIDATION_FAILED",
        }
    }
}
