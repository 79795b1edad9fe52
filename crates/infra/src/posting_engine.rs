//! Idempotent, balanced, atomic application of postings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use waypost_core::{AccountId, Currency, OrgId, Outcome, PostingId};
use waypost_events::{AuditScope, AuditSink, emit};
use waypost_ledger::{
    Account, AccountBalance, AccountStatus, LedgerEntry, LedgerError, LedgerEvent, LedgerPosting, OpenAccount,
    PostingKey, PostingRequest, Tolerance, amendment_delta, reversal_lines,
};

use crate::error::EngineError;
use crate::store::{Inserted, LedgerStore};

/// Applies postings through a [`LedgerStore`].
///
/// The `(org, source, event)` key is the idempotency key: a replay returns
/// the stored header and writes nothing. Balances are updated by the store in
/// the same unit of work as the entries.
#[derive(Clone)]
pub struct PostingEngine {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    tolerance: Tolerance,
    amendment_tolerance: Tolerance,
}

impl PostingEngine {
    pub fn new(store: Arc<dyn LedgerStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            audit,
            tolerance: Tolerance::DEFAULT,
            amendment_tolerance: Tolerance::DEFAULT,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    pub fn with_amendment_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.amendment_tolerance = tolerance;
        self
    }

    /// Movement an amendment from `previous` to `current` must post, or `None`
    /// when the change is within the amendment tolerance.
    pub fn amendment_delta(&self, previous: Decimal, current: Decimal) -> Option<Decimal> {
        amendment_delta(previous, current, self.amendment_tolerance)
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    #[instrument(skip(self, request), fields(key = %request.key), err)]
    pub async fn post(&self, request: PostingRequest) -> Result<Outcome<LedgerPosting>, EngineError> {
        request.validate(self.tolerance)?;

        if let Some(existing) = self.store.posting(&request.key).await? {
            debug!(posting_id = %existing.id, "posting already applied");
            return Ok(Outcome::AlreadyApplied(existing));
        }

        let accounts = self.store.accounts(request.key.org_id, &request.account_ids()).await?;
        request.validate_accounts(&accounts)?;

        let (posting, entries) = request.into_records(Utc::now());
        match self.store.append_posting(&posting, &entries).await? {
            Inserted::New(posting) => {
                info!(posting_id = %posting.id, entries = posting.entry_count, "posting applied");
                emit(
                    self.audit.as_ref(),
                    AuditScope::Org(posting.org_id),
                    posting.key().to_string(),
                    &LedgerEvent::PostingApplied {
                        org_id: posting.org_id,
                        posting_id: posting.id,
                        source: posting.source.clone(),
                        event: posting.event.clone(),
                        entry_count: posting.entry_count,
                        occurred_at: posting.occurred_at,
                    },
                );
                Ok(Outcome::Applied(posting))
            }
            Inserted::Existing(posting) => {
                debug!(posting_id = %posting.id, "lost insert race; returning stored posting");
                Ok(Outcome::AlreadyApplied(posting))
            }
        }
    }

    /// Post the mirror image of `original` under `reversal_event`.
    pub async fn reverse(
        &self,
        original: &PostingKey,
        reversal_event: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Outcome<LedgerPosting>, EngineError> {
        let posting = self
            .store
            .posting(original)
            .await?
            .ok_or_else(|| EngineError::PostingNotFound(original.to_string()))?;
        let entries = self.store.entries(posting.org_id, posting.id).await?;

        let key = PostingKey::new(original.org_id, original.source.clone(), reversal_event)?;
        self.post(PostingRequest::new(key, occurred_at, reversal_lines(&entries)))
            .await
    }

    pub async fn open_account(&self, cmd: OpenAccount) -> Result<Outcome<Account>, EngineError> {
        let now = Utc::now();
        let account = Account::open(cmd, now)?;
        let inserted = self.store.insert_account(&account).await?;
        if let Inserted::New(account) = &inserted {
            info!(org_id = %account.org_id, account_id = %account.id, code = %account.code, "account opened");
            emit(
                self.audit.as_ref(),
                AuditScope::Org(account.org_id),
                account.id.to_string(),
                &LedgerEvent::AccountOpened {
                    org_id: account.org_id,
                    account_id: account.id,
                    account_type: account.account_type,
                    code: account.code.clone(),
                    occurred_at: now,
                },
            );
        }
        Ok(inserted.into_outcome())
    }

    /// Archived accounts reject new entries; history and balances stay.
    pub async fn archive_account(&self, org_id: OrgId, account_id: AccountId) -> Result<(), EngineError> {
        let accounts = self.store.accounts(org_id, &[account_id]).await?;
        let account = accounts
            .get(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        if account.status == AccountStatus::Archived {
            return Ok(());
        }

        self.store
            .set_account_status(org_id, account_id, AccountStatus::Archived)
            .await?;
        emit(
            self.audit.as_ref(),
            AuditScope::Org(org_id),
            account_id.to_string(),
            &LedgerEvent::AccountArchived {
                org_id,
                account_id,
                occurred_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn posting(&self, key: &PostingKey) -> Result<Option<LedgerPosting>, EngineError> {
        Ok(self.store.posting(key).await?)
    }

    pub async fn entries(&self, org_id: OrgId, posting_id: PostingId) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.store.entries(org_id, posting_id).await?)
    }

    /// Cached balance; an account without entries reads as zero.
    pub async fn balance(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<AccountBalance, EngineError> {
        Ok(self
            .store
            .balance(org_id, account_id, currency)
            .await?
            .unwrap_or_else(|| AccountBalance::empty(org_id, account_id, currency, Utc::now())))
    }
}
