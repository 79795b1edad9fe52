use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{AccountId, Currency, DomainError, EntryId, OrgId, PostingId, SourceRef};

use crate::account::Account;
use crate::entry::{Direction, EntryLine, LedgerEntry};
use crate::error::LedgerError;
use crate::tolerance::Tolerance;

/// Idempotency key of a posting: one business event applies at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostingKey {
    pub org_id: OrgId,
    pub source: SourceRef,
    pub event: String,
}

impl PostingKey {
    pub fn new(org_id: OrgId, source: SourceRef, event: impl Into<String>) -> Result<Self, DomainError> {
        let event = event.into().trim().to_string();
        if event.is_empty() {
            return Err(DomainError::validation("posting event must not be empty"));
        }
        Ok(Self {
            org_id,
            source,
            event,
        })
    }
}

impl core::fmt::Display for PostingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}#{}", self.org_id, self.source, self.event)
    }
}

/// A request to apply one balanced group of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingRequest {
    pub key: PostingKey,
    pub occurred_at: DateTime<Utc>,
    pub lines: Vec<EntryLine>,
}

impl PostingRequest {
    pub fn new(key: PostingKey, occurred_at: DateTime<Utc>, lines: Vec<EntryLine>) -> Self {
        Self {
            key,
            occurred_at,
            lines,
        }
    }

    /// Per-currency (debit, credit) totals.
    pub fn totals(&self) -> BTreeMap<Currency, (Decimal, Decimal)> {
        let mut totals: BTreeMap<Currency, (Decimal, Decimal)> = BTreeMap::new();
        for line in &self.lines {
            let slot = totals.entry(line.currency).or_default();
            match line.direction {
                Direction::Debit => slot.0 += line.amount.value(),
                Direction::Credit => slot.1 += line.amount.value(),
            }
        }
        totals
    }

    /// Structural validation: non-empty and balanced per currency.
    pub fn validate(&self, tolerance: Tolerance) -> Result<(), LedgerError> {
        if self.lines.is_empty() {
            return Err(LedgerError::EmptyPosting);
        }

        for (currency, (debit, credit)) in self.totals() {
            if !tolerance.absorbs(debit - credit) {
                return Err(LedgerError::Unbalanced {
                    currency,
                    debit,
                    credit,
                });
            }
        }

        Ok(())
    }

    /// Validation against the accounts the lines touch. `accounts` must only
    /// contain accounts of the request's org.
    pub fn validate_accounts(&self, accounts: &HashMap<AccountId, Account>) -> Result<(), LedgerError> {
        for line in &self.lines {
            let account = accounts
                .get(&line.account_id)
                .filter(|a| a.org_id == self.key.org_id)
                .ok_or(LedgerError::AccountNotFound(line.account_id))?;

            if !account.is_active() {
                return Err(LedgerError::AccountArchived(account.id));
            }
            if account.currency != line.currency {
                return Err(LedgerError::CurrencyMismatch {
                    account: account.id,
                    expected: account.currency,
                    found: line.currency,
                });
            }
        }
        Ok(())
    }

    /// Distinct account ids referenced by the lines, in first-seen order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = Vec::new();
        for line in &self.lines {
            if !ids.contains(&line.account_id) {
                ids.push(line.account_id);
            }
        }
        ids
    }

    /// Materialize the header and its immutable entries.
    pub fn into_records(self, posted_at: DateTime<Utc>) -> (LedgerPosting, Vec<LedgerEntry>) {
        let posting = LedgerPosting {
            id: PostingId::new(),
            org_id: self.key.org_id,
            source: self.key.source.clone(),
            event: self.key.event.clone(),
            occurred_at: self.occurred_at,
            created_at: posted_at,
            entry_count: self.lines.len() as u32,
        };

        let entries = self
            .lines
            .into_iter()
            .map(|line| LedgerEntry {
                id: EntryId::new(),
                posting_id: posting.id,
                org_id: posting.org_id,
                account_id: line.account_id,
                currency: line.currency,
                direction: line.direction,
                amount: line.amount,
                occurred_at: self.occurred_at,
                posted_at,
                source: posting.source.clone(),
                event: posting.event.clone(),
                memo: line.memo,
                meta: line.meta,
            })
            .collect();

        (posting, entries)
    }
}

/// Idempotency header grouping the entries produced by one business event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub id: PostingId,
    pub org_id: OrgId,
    pub source: SourceRef,
    pub event: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub entry_count: u32,
}

impl LedgerPosting {
    pub fn key(&self) -> PostingKey {
        PostingKey {
            org_id: self.org_id,
            source: self.source.clone(),
            event: self.event.clone(),
        }
    }
}

/// Mirror of `entries` (debits become credits and vice versa), used to build
/// a compensating posting under a new event tag.
pub fn reversal_lines(entries: &[LedgerEntry]) -> Vec<EntryLine> {
    entries
        .iter()
        .map(|e| EntryLine {
            account_id: e.account_id,
            currency: e.currency,
            direction: e.direction.opposite(),
            amount: e.amount,
            memo: Some(format!("reversal of {}", e.event)),
            meta: e.meta.clone(),
        })
        .collect()
}
