use rust_decimal::Decimal;
use thiserror::Error;

use waypost_core::{AgencyId, Currency, DomainError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreditError {
    #[error("credit limit exceeded: exposure {exposure} + {requested} > {limit} {currency}")]
    LimitExceeded {
        limit: Decimal,
        exposure: Decimal,
        requested: Decimal,
        currency: Currency,
    },

    #[error("no credit profile for agency {0}")]
    ProfileNotFound(AgencyId),

    #[error("agency {agency_id} has no ledger account in {currency}")]
    NoAgencyAccount { agency_id: AgencyId, currency: Currency },

    #[error("credit for agency {0} is suspended")]
    Suspended(AgencyId),

    #[error("credit profile is kept in {expected}, request is in {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl CreditError {
    pub fn code(&self) -> &'static str {
        match self {
            CreditError::LimitExceeded { .. } => "CREDIT_LIMIT_EXCEEDED",
            CreditError::ProfileNotFound(_) => "CREDIT_PROFILE_NOT_FOUND",
            CreditError::NoAgencyAccount { .. } => "CREDIT_ACCOUNT_NOT_FOUND",
            CreditError::Suspended(_) => "CREDIT_SUSPENDED",
            CreditError::CurrencyMismatch { .. } => "CREDIT_CURRENCY_MISMATCH",
            CreditError::Domain(_) => "VALIDATION_FAILED",
        }
    }

    /// Message safe to show to the agency. Only the limit breach carries
    /// detail; everything else is operational.
    pub fn user_message(&self) -> String {
        match self {
            CreditError::LimitExceeded {
                limit,
                exposure,
                requested,
                currency,
            } => {
                let available = (*limit - *exposure).max(Decimal::ZERO);
                format!(
                    "Credit limit of {limit} {currency} would be exceeded: {exposure} {currency} is outstanding \
                     and {requested} {currency} was requested ({available} {currency} available)."
                )
            }
            _ => "The operation could not be completed. Please try again later.".to_string(),
        }
    }
}
