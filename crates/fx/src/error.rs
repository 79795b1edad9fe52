use chrono::{DateTime, Utc};
use thiserror::Error;

use waypost_core::{Currency, DomainError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FxError {
    #[error("no {base}/{quote} rate at or before {as_of}")]
    RateNotFound {
        base: Currency,
        quote: Currency,
        as_of: DateTime<Utc>,
    },

    #[error("snapshot is {base}/{quote}, amount is in {found}")]
    CurrencyMismatch {
        base: Currency,
        quote: Currency,
        found: Currency,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl FxError {
    pub fn code(&self) -> &'static str {
        match self {
            FxError::RateNotFound { .. } => "FX_RATE_NOT_FOUND",
            FxError::CurrencyMismatch { .. } => "FX_CURRENCY_MISMATCH",
            FxError::Domain(_) => "VALIDATION_FAILED",
        }
    }
}
