use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::{AccountId, OrgId, PostingId, SourceRef};
use waypost_events::Event;

use crate::account::AccountType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    PostingApplied {
        org_id: OrgId,
        posting_id: PostingId,
        source: SourceRef,
        event: String,
        entry_count: u32,
        occurred_at: DateTime<Utc>,
    },
    AccountOpened {
        org_id: OrgId,
        account_id: AccountId,
        account_type: AccountType,
        code: String,
        occurred_at: DateTime<Utc>,
    },
    AccountArchived {
        org_id: OrgId,
        account_id: AccountId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::PostingApplied { .. } => "ledger.posting.applied",
            LedgerEvent::AccountOpened { .. } => "ledger.account.opened",
            LedgerEvent::AccountArchived { .. } => "ledger.account.archived",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::PostingApplied { occurred_at, .. }
            | LedgerEvent::AccountOpened { occurred_at, .. }
            | LedgerEvent::AccountArchived { occurred_at, .. } => *occurred_at,
        }
    }
}
