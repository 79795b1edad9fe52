use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{Currency, DomainError, OrgId};

/// An externally sourced, dated rate: `rate` quote units buy 1 base unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxRate {
    pub org_id: OrgId,
    pub base: Currency,
    pub quote: Currency,
    pub rate: Decimal,
    pub as_of: DateTime<Utc>,
    pub source: String,
}

impl FxRate {
    pub fn new(
        org_id: OrgId,
        base: Currency,
        quote: Currency,
        rate: Decimal,
        as_of: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if base == quote {
            return Err(DomainError::validation(format!(
                "rate pair must differ, got {base}/{quote}"
            )));
        }
        if rate <= Decimal::ZERO {
            return Err(DomainError::validation(format!("rate must be positive, got {rate}")));
        }
        Ok(Self {
            org_id,
            base,
            quote,
            rate,
            as_of,
            source: source.into(),
        })
    }
}

/// The rate with the greatest `as_of` not after `at`. Future-dated rates are
/// never returned.
pub fn latest_at<'a>(
    rates: impl IntoIterator<Item = &'a FxRate>,
    base: Currency,
    quote: Currency,
    at: DateTime<Utc>,
) -> Option<&'a FxRate> {
    rates
        .into_iter()
        .filter(|r| r.base == base && r.quote == quote && r.as_of <= at)
        .max_by_key(|r| r.as_of)
}
