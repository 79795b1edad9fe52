use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{AccountId, Currency, OrgId};

use crate::entry::{Direction, LedgerEntry};

/// Cached rollup of entries per (account, currency).
///
/// Updated in the same transaction as the posting that produced the entries,
/// so it equals the sum of entries except while a partial failure is being
/// reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub org_id: OrgId,
    pub account_id: AccountId,
    pub currency: Currency,
    pub debit_total: Decimal,
    pub credit_total: Decimal,
    pub entry_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn empty(org_id: OrgId, account_id: AccountId, currency: Currency, now: DateTime<Utc>) -> Self {
        Self {
            org_id,
            account_id,
            currency,
            debit_total: Decimal::ZERO,
            credit_total: Decimal::ZERO,
            entry_count: 0,
            updated_at: now,
        }
    }

    /// Debit-positive net balance.
    pub fn net(&self) -> Decimal {
        self.debit_total - self.credit_total
    }

    /// What the account owner owes: the positive part of the net balance.
    pub fn exposure(&self) -> Decimal {
        self.net().max(Decimal::ZERO)
    }

    pub fn apply(&mut self, entry: &LedgerEntry) {
        match entry.direction {
            Direction::Debit => self.debit_total += entry.amount.value(),
            Direction::Credit => self.credit_total += entry.amount.value(),
        }
        self.entry_count += 1;
        if entry.posted_at > self.updated_at {
            self.updated_at = entry.posted_at;
        }
    }

    /// Rebuild from the full entry history (reconciliation path).
    pub fn from_entries<'a>(
        org_id: OrgId,
        account_id: AccountId,
        currency: Currency,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut balance = Self::empty(org_id, account_id, currency, now);
        for e in entries {
            if e.account_id == account_id && e.currency == currency && e.org_id == org_id {
                balance.apply(e);
            }
        }
        balance
    }
}
