use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{Amount, Currency};

use crate::error::CreditError;
use crate::profile::CreditProfile;

/// An allowed credit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDecision {
    pub currency: Currency,
    pub exposure: Decimal,
    pub requested: Decimal,
    /// Exposure after the requested amount is reserved.
    pub projected: Decimal,
    pub credit_limit: Decimal,
    pub soft_limit: Decimal,
    /// The caller must raise an operational incident.
    pub soft_limit_breached: bool,
}

impl CreditDecision {
    pub fn headroom(&self) -> Decimal {
        self.credit_limit - self.projected
    }
}

/// Gate `requested` against the profile given the agency's current
/// `exposure` (positive net debit in the profile currency).
pub fn evaluate(
    profile: &CreditProfile,
    exposure: Decimal,
    requested: Amount,
    currency: Currency,
) -> Result<CreditDecision, CreditError> {
    if !profile.is_active() {
        return Err(CreditError::Suspended(profile.agency_id));
    }
    if currency != profile.currency {
        return Err(CreditError::CurrencyMismatch {
            expected: profile.currency,
            found: currency,
        });
    }

    let exposure = exposure.max(Decimal::ZERO);
    let projected = exposure + requested.value();
    if projected > profile.credit_limit {
        return Err(CreditError::LimitExceeded {
            limit: profile.credit_limit,
            exposure,
            requested: requested.value(),
            currency,
        });
    }

    Ok(CreditDecision {
        currency,
        exposure,
        requested: requested.value(),
        projected,
        credit_limit: profile.credit_limit,
        soft_limit: profile.soft_limit,
        soft_limit_breached: projected > profile.soft_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use waypost_core::{AgencyId, OrgId};

    fn profile(limit: Decimal, soft: Decimal) -> CreditProfile {
        CreditProfile::new(OrgId::new(), AgencyId::new(), limit, soft, Currency::EUR, 30, Utc::now()).unwrap()
    }

    fn amt(d: Decimal) -> Amount {
        Amount::new(d).unwrap()
    }

    #[test]
    fn within_soft_limit_is_clean() {
        let d = evaluate(&profile(dec!(1000), dec!(800)), dec!(100), amt(dec!(200)), Currency::EUR).unwrap();
        assert!(!d.soft_limit_breached);
        assert_eq!(d.projected, dec!(300));
        assert_eq!(d.headroom(), dec!(700));
    }

    #[test]
    fn between_soft_and_hard_limit_is_flagged() {
        let d = evaluate(&profile(dec!(1000), dec!(800)), dec!(700), amt(dec!(200)), Currency::EUR).unwrap();
        assert!(d.soft_limit_breached);
    }

    #[test]
    fn reaching_the_limit_exactly_is_allowed() {
        assert!(evaluate(&profile(dec!(1000), dec!(800)), dec!(600), amt(dec!(400)), Currency::EUR).is_ok());
    }

    #[test]
    fn beyond_hard_limit_is_rejected_with_detail() {
        let err = evaluate(&profile(dec!(1000), dec!(800)), dec!(900), amt(dec!(150)), Currency::EUR).unwrap_err();
        assert_eq!(
            err,
            CreditError::LimitExceeded {
                limit: dec!(1000),
                exposure: dec!(900),
                requested: dec!(150),
                currency: Currency::EUR,
            }
        );
    }

    #[test]
    fn credit_balance_does_not_extend_the_limit() {
        // A prepaid agency (net credit) still cannot exceed the ceiling.
        let err = evaluate(&profile(dec!(100), dec!(100)), dec!(-500), amt(dec!(150)), Currency::EUR).unwrap_err();
        assert_eq!(err.code(), "CREDIT_LIMIT_EXCEEDED");
    }

    #[test]
    fn suspended_and_foreign_currency_are_rejected() {
        let mut p = profile(dec!(1000), dec!(800));
        assert!(matches!(
            evaluate(&p, dec!(0), amt(dec!(1)), Currency::USD),
            Err(CreditError::CurrencyMismatch { .. })
        ));
        p.suspend(Utc::now());
        assert!(matches!(
            evaluate(&p, dec!(0), amt(dec!(1)), Currency::EUR),
            Err(CreditError::Suspended(_))
        ));
    }

    proptest! {
        #[test]
        fn allowed_decisions_never_exceed_the_limit(
            limit in 0i64..1_000_000,
            exposure in 0i64..1_000_000,
            requested in 0i64..1_000_000,
        ) {
            let p = profile(Decimal::new(limit, 2), Decimal::new(limit, 2));
            match evaluate(&p, Decimal::new(exposure, 2), amt(Decimal::new(requested, 2)), Currency::EUR) {
                Ok(d) => prop_assert!(d.projected <= p.credit_limit),
                Err(CreditError::LimitExceeded { .. }) => prop_assert!(exposure + requested > limit),
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
