use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{AccountId, Amount, Currency, ValueObject, round_money};
use waypost_ledger::EntryLine;

use crate::policy::{CancellationPolicy, PolicyKind};

/// Read-only amounts taken from the booking document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingAmounts {
    pub currency: Currency,
    pub sell: Decimal,
}

/// Caller-forced manual mode, optionally with the amount to refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManualRequest {
    pub requested: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundBasis {
    Policy,
    Manual,
    None,
}

impl RefundBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundBasis::Policy => "policy",
            RefundBasis::Manual => "manual",
            RefundBasis::None => "none",
        }
    }
}

/// `refundable + penalty == gross_sell`, all rounded to cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundComputation {
    pub currency: Currency,
    pub gross_sell: Decimal,
    pub penalty: Decimal,
    pub refundable: Decimal,
    pub basis: RefundBasis,
    pub policy_ref: Option<String>,
}

impl ValueObject for RefundComputation {}

impl RefundComputation {
    /// Lines paying `refundable` back: debit the platform side, credit the customer.
    pub fn payout_lines(&self, platform: AccountId, customer: AccountId) -> Vec<EntryLine> {
        let amount = Amount::new(self.refundable).unwrap_or(Amount::ZERO);
        vec![
            EntryLine::debit(platform, self.currency, amount).with_memo("refund payout"),
            EntryLine::credit(customer, self.currency, amount).with_memo("refund payout"),
        ]
    }
}

/// Compute the refund for a cancelled booking.
///
/// A policy is used unless `manual` is given. Without a usable policy the
/// whole gross is refundable unless a manual amount says otherwise.
pub fn compute_refund(
    amounts: &BookingAmounts,
    policy: Option<&CancellationPolicy>,
    now: DateTime<Utc>,
    manual: Option<ManualRequest>,
) -> RefundComputation {
    let gross = round_money(amounts.sell.max(Decimal::ZERO));

    let (raw_penalty, basis, policy_ref) = match (policy, manual) {
        (Some(policy), None) => {
            let reference = policy.reference.clone();
            match policy_penalty(policy, gross, now) {
                Some(penalty) => (penalty, RefundBasis::Policy, reference),
                None => (Decimal::ZERO, RefundBasis::None, reference),
            }
        }
        (_, manual) => match manual.and_then(|m| m.requested) {
            Some(requested) => (gross - requested, RefundBasis::Manual, None),
            None => (Decimal::ZERO, RefundBasis::None, None),
        },
    };

    let penalty = round_money(raw_penalty.clamp(Decimal::ZERO, gross));

    RefundComputation {
        currency: amounts.currency,
        gross_sell: gross,
        penalty,
        refundable: gross - penalty,
        basis,
        policy_ref,
    }
}

/// `None` when the policy type is not understood.
fn policy_penalty(policy: &CancellationPolicy, gross: Decimal, now: DateTime<Utc>) -> Option<Decimal> {
    if let PolicyKind::Unknown(_) = policy.kind {
        return None;
    }
    if policy.free_until.is_some_and(|until| now < until) {
        return Some(Decimal::ZERO);
    }
    let penalty = match &policy.kind {
        PolicyKind::Percent(pct) => gross * *pct / Decimal::ONE_HUNDRED,
        PolicyKind::Fixed(value) => *value,
        PolicyKind::Nights(nights) if *nights >= 1 => gross,
        PolicyKind::Nights(_) => Decimal::ZERO,
        PolicyKind::Unknown(_) => return None,
    };
    Some(penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn eur(sell: Decimal) -> BookingAmounts {
        BookingAmounts {
            currency: Currency::EUR,
            sell,
        }
    }

    #[test]
    fn percent_policy_on_a_hundred_euro_booking() {
        let policy = CancellationPolicy::new(PolicyKind::Percent(dec!(20))).with_reference("P-20");
        let r = compute_refund(&eur(dec!(100)), Some(&policy), Utc::now(), None);
        assert_eq!(r.penalty, dec!(20.00));
        assert_eq!(r.refundable, dec!(80.00));
        assert_eq!(r.basis, RefundBasis::Policy);
        assert_eq!(r.basis.as_str(), "policy");
        assert_eq!(r.policy_ref.as_deref(), Some("P-20"));
    }

    #[test]
    fn fixed_penalty_is_capped_at_gross() {
        let policy = CancellationPolicy::new(PolicyKind::Fixed(dec!(150)));
        let r = compute_refund(&eur(dec!(100)), Some(&policy), Utc::now(), None);
        assert_eq!(r.penalty, dec!(100));
        assert_eq!(r.refundable, dec!(0));
    }

    #[test]
    fn nights_policy_is_all_or_nothing() {
        let one = CancellationPolicy::new(PolicyKind::Nights(1));
        let r = compute_refund(&eur(dec!(240)), Some(&one), Utc::now(), None);
        assert_eq!((r.penalty, r.refundable), (dec!(240), dec!(0)));

        let zero = CancellationPolicy::new(PolicyKind::Nights(0));
        let r = compute_refund(&eur(dec!(240)), Some(&zero), Utc::now(), None);
        assert_eq!((r.penalty, r.refundable), (dec!(0), dec!(240)));
    }

    #[test]
    fn unknown_policy_refunds_everything_with_basis_none() {
        let policy = CancellationPolicy::new(PolicyKind::Unknown("tiered".into()));
        let r = compute_refund(&eur(dec!(100)), Some(&policy), Utc::now(), None);
        assert_eq!(r.penalty, dec!(0));
        assert_eq!(r.refundable, dec!(100));
        assert_eq!(r.basis, RefundBasis::None);
    }

    #[test]
    fn free_cancellation_window_waives_the_penalty() {
        let now = Utc::now();
        let policy = CancellationPolicy::new(PolicyKind::Percent(dec!(50))).with_free_until(now + Duration::hours(1));
        let r = compute_refund(&eur(dec!(100)), Some(&policy), now, None);
        assert_eq!(r.penalty, dec!(0));
        assert_eq!(r.basis, RefundBasis::Policy);

        let r = compute_refund(&eur(dec!(100)), Some(&policy), now + Duration::hours(2), None);
        assert_eq!(r.penalty, dec!(50));
    }

    #[test]
    fn manual_mode_overrides_the_policy() {
        let policy = CancellationPolicy::new(PolicyKind::Percent(dec!(20)));
        let manual = ManualRequest {
            requested: Some(dec!(30)),
        };
        let r = compute_refund(&eur(dec!(100)), Some(&policy), Utc::now(), Some(manual));
        assert_eq!(r.refundable, dec!(30));
        assert_eq!(r.penalty, dec!(70));
        assert_eq!(r.basis, RefundBasis::Manual);
        assert_eq!(r.policy_ref, None);
    }

    #[test]
    fn no_policy_and_no_amount_refunds_gross() {
        let r = compute_refund(&eur(dec!(99.999)), None, Utc::now(), None);
        assert_eq!(r.gross_sell, dec!(100.00));
        assert_eq!(r.refundable, dec!(100.00));
        assert_eq!(r.basis, RefundBasis::None);

        let r = compute_refund(&eur(dec!(50)), None, Utc::now(), Some(ManualRequest::default()));
        assert_eq!(r.refundable, dec!(50));
        assert_eq!(r.basis, RefundBasis::None);
    }

    #[test]
    fn negative_sell_and_oversized_manual_amounts_are_clamped() {
        let r = compute_refund(&eur(dec!(-20)), None, Utc::now(), None);
        assert_eq!((r.gross_sell, r.penalty, r.refundable), (dec!(0), dec!(0), dec!(0)));

        let manual = ManualRequest {
            requested: Some(dec!(500)),
        };
        let r = compute_refund(&eur(dec!(100)), None, Utc::now(), Some(manual));
        assert_eq!((r.penalty, r.refundable), (dec!(0), dec!(100)));
    }

    #[test]
    fn payout_lines_balance() {
        let policy = CancellationPolicy::new(PolicyKind::Percent(dec!(20)));
        let r = compute_refund(&eur(dec!(100)), Some(&policy), Utc::now(), None);
        let lines = r.payout_lines(AccountId::new(), AccountId::new());
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.amount.value() == dec!(80)));
    }

    fn any_policy() -> impl Strategy<Value = Option<CancellationPolicy>> {
        prop_oneof![
            Just(None),
            (-50i64..20_000).prop_map(|v| Some(CancellationPolicy::new(PolicyKind::Percent(Decimal::new(v, 2))))),
            (-1_000i64..10_000_000).prop_map(|v| Some(CancellationPolicy::new(PolicyKind::Fixed(Decimal::new(v, 3))))),
            (0u32..5).prop_map(|n| Some(CancellationPolicy::new(PolicyKind::Nights(n)))),
            Just(Some(CancellationPolicy::new(PolicyKind::Unknown("x".into())))),
        ]
    }

    fn any_manual() -> impl Strategy<Value = Option<ManualRequest>> {
        prop_oneof![
            Just(None),
            Just(Some(ManualRequest::default())),
            (-1_000i64..10_000_000).prop_map(|v| Some(ManualRequest {
                requested: Some(Decimal::new(v, 3))
            })),
        ]
    }

    proptest! {
        #[test]
        fn refundable_plus_penalty_is_gross(
            sell in -100_000i64..10_000_000i64,
            policy in any_policy(),
            manual in any_manual(),
        ) {
            let r = compute_refund(&eur(Decimal::new(sell, 3)), policy.as_ref(), Utc::now(), manual);
            prop_assert_eq!(r.refundable + r.penalty, r.gross_sell);
            prop_assert!(r.penalty >= Decimal::ZERO);
            prop_assert!(r.penalty <= r.gross_sell);
            prop_assert_eq!(r.refundable, round_money(r.refundable));
            prop_assert_eq!(r.penalty, round_money(r.penalty));
        }
    }
}
