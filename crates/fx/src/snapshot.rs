use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{Amount, ContextRef, Currency, OrgId, SnapshotId, round_money};

use crate::error::FxError;
use crate::rate::FxRate;

/// Unique key of a snapshot: one frozen rate per (org, context, pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub org_id: OrgId,
    pub context: ContextRef,
    pub base: Currency,
    pub quote: Currency,
}

/// The rate applied to one business context. Never updated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxRateSnapshot {
    pub id: SnapshotId,
    pub org_id: OrgId,
    pub context: ContextRef,
    pub base: Currency,
    pub quote: Currency,
    /// Quote units per 1 base unit.
    pub rate: Decimal,
    /// `as_of` of the rate that was frozen.
    pub rate_as_of: DateTime<Utc>,
    pub rate_source: String,
    pub created_at: DateTime<Utc>,
}

impl FxRateSnapshot {
    pub fn freeze(key: SnapshotKey, rate: &FxRate, now: DateTime<Utc>) -> Self {
        Self {
            id: SnapshotId::new(),
            org_id: key.org_id,
            context: key.context,
            base: key.base,
            quote: key.quote,
            rate: rate.rate,
            rate_as_of: rate.as_of,
            rate_source: rate.source.clone(),
            created_at: now,
        }
    }

    /// Snapshot for a same-currency context: rate 1, no table lookup.
    pub fn identity(key: SnapshotKey, now: DateTime<Utc>) -> Self {
        Self {
            id: SnapshotId::new(),
            org_id: key.org_id,
            context: key.context,
            base: key.base,
            quote: key.quote,
            rate: Decimal::ONE,
            rate_as_of: now,
            rate_source: "identity".to_string(),
            created_at: now,
        }
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            org_id: self.org_id,
            context: self.context.clone(),
            base: self.base,
            quote: self.quote,
        }
    }
}

/// `amount` in the snapshot's base currency, converted to its quote currency
/// and rounded to cents.
pub fn convert(amount: Amount, currency: Currency, snapshot: &FxRateSnapshot) -> Result<Amount, FxError> {
    if currency != snapshot.base {
        return Err(FxError::CurrencyMismatch {
            base: snapshot.base,
            quote: snapshot.quote,
            found: currency,
        });
    }
    Ok(Amount::new(round_money(amount.value() * snapshot.rate))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key(base: Currency, quote: Currency) -> SnapshotKey {
        SnapshotKey {
            org_id: OrgId::new(),
            context: ContextRef::new("booking", "BK-7").unwrap(),
            base,
            quote,
        }
    }

    #[test]
    fn convert_multiplies_by_quote_per_base_and_rounds() {
        let k = key(Currency::USD, Currency::EUR);
        let rate = FxRate::new(k.org_id, Currency::USD, Currency::EUR, dec!(0.9235), Utc::now(), "ecb").unwrap();
        let snap = FxRateSnapshot::freeze(k, &rate, Utc::now());

        let eur = convert(Amount::new(dec!(100)).unwrap(), Currency::USD, &snap).unwrap();
        assert_eq!(eur.value(), dec!(92.35));

        let eur = convert(Amount::new(dec!(10.01)).unwrap(), Currency::USD, &snap).unwrap();
        // 9.244235 → 9.24
        assert_eq!(eur.value(), dec!(9.24));
    }

    #[test]
    fn convert_rejects_amounts_in_the_wrong_currency() {
        let snap = FxRateSnapshot::identity(key(Currency::EUR, Currency::EUR), Utc::now());
        let err = convert(Amount::new(dec!(1)).unwrap(), Currency::USD, &snap).unwrap_err();
        assert_eq!(err.code(), "FX_CURRENCY_MISMATCH");
    }

    #[test]
    fn identity_snapshot_keeps_amounts() {
        let snap = FxRateSnapshot::identity(key(Currency::EUR, Currency::EUR), Utc::now());
        let out = convert(Amount::new(dec!(12.345)).unwrap(), Currency::EUR, &snap).unwrap();
        assert_eq!(out.value(), dec!(12.35));
        assert_eq!(snap.rate_source, "identity");
    }
}
