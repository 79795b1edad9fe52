use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use waypost_core::{AccountId, Amount, Currency, EntryId, OrgId, PostingId, SourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

/// One requested side of a posting (not yet persisted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLine {
    pub account_id: AccountId,
    pub currency: Currency,
    pub direction: Direction,
    pub amount: Amount,
    pub memo: Option<String>,
    #[serde(default)]
    pub meta: JsonValue,
}

impl EntryLine {
    pub fn debit(account_id: AccountId, currency: Currency, amount: Amount) -> Self {
        Self {
            account_id,
            currency,
            direction: Direction::Debit,
            amount,
            memo: None,
            meta: JsonValue::Null,
        }
    }

    pub fn credit(account_id: AccountId, currency: Currency, amount: Amount) -> Self {
        Self {
            direction: Direction::Credit,
            ..Self::debit(account_id, currency, amount)
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }
}

/// One-sided, immutable money movement belonging to exactly one posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub posting_id: PostingId,
    pub org_id: OrgId,
    pub account_id: AccountId,
    pub currency: Currency,
    pub direction: Direction,
    pub amount: Amount,
    pub occurred_at: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    pub source: SourceRef,
    pub event: String,
    pub memo: Option<String>,
    pub meta: JsonValue,
}
