use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use waypost_core::{AccountId, Currency, OrgId, PostingId};
use waypost_ledger::{Account, AccountBalance, AccountStatus, AccountType, LedgerEntry, LedgerPosting, PostingKey};

use super::{Inserted, StoreError};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Unique on `(org_id, code)`.
    async fn insert_account(&self, account: &Account) -> Result<Inserted<Account>, StoreError>;

    async fn set_account_status(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<(), StoreError>;

    /// Accounts of `org_id` among `ids`; ids of other orgs are simply absent.
    async fn accounts(&self, org_id: OrgId, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError>;

    async fn find_account(
        &self,
        org_id: OrgId,
        account_type: AccountType,
        owner_id: Uuid,
        currency: Currency,
    ) -> Result<Option<Account>, StoreError>;

    /// Header, entries and balance increments in one atomic unit. A header
    /// key collision writes nothing and returns the stored header.
    async fn append_posting(
        &self,
        posting: &LedgerPosting,
        entries: &[LedgerEntry],
    ) -> Result<Inserted<LedgerPosting>, StoreError>;

    async fn posting(&self, key: &PostingKey) -> Result<Option<LedgerPosting>, StoreError>;

    async fn entries(&self, org_id: OrgId, posting_id: PostingId) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn balance(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Option<AccountBalance>, StoreError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<(OrgId, AccountId), Account>,
    postings: HashMap<PostingKey, LedgerPosting>,
    entries: HashMap<(OrgId, PostingId), Vec<LedgerEntry>>,
    balances: HashMap<(OrgId, AccountId, Currency), AccountBalance>,
}

/// In-memory ledger for tests/dev. One lock covers the whole state so a
/// posting is atomic with its balance updates.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    inner: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored entries of `org_id`.
    pub fn entry_count(&self, org_id: OrgId) -> usize {
        match self.inner.read() {
            Ok(s) => s
                .entries
                .iter()
                .filter(|((org, _), _)| *org == org_id)
                .map(|(_, v)| v.len())
                .sum(),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_account(&self, account: &Account) -> Result<Inserted<Account>, StoreError> {
        let mut state = self.inner.write().map_err(|_| StoreError::poisoned("ledger"))?;
        if let Some(existing) = state
            .accounts
            .values()
            .find(|a| a.org_id == account.org_id && a.code == account.code)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        state.accounts.insert((account.org_id, account.id), account.clone());
        Ok(Inserted::New(account.clone()))
    }

    async fn set_account_status(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().map_err(|_| StoreError::poisoned("ledger"))?;
        let account = state
            .accounts
            .get_mut(&(org_id, account_id))
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        account.status = status;
        Ok(())
    }

    async fn accounts(&self, org_id: OrgId, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        let state = self.inner.read().map_err(|_| StoreError::poisoned("ledger"))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.accounts.get(&(org_id, *id)).map(|a| (*id, a.clone())))
            .collect())
    }

    async fn find_account(
        &self,
        org_id: OrgId,
        account_type: AccountType,
        owner_id: Uuid,
        currency: Currency,
    ) -> Result<Option<Account>, StoreError> {
        let state = self.inner.read().map_err(|_| StoreError::poisoned("ledger"))?;
        Ok(state
            .accounts
            .values()
            .find(|a| {
                a.org_id == org_id
                    && a.account_type == account_type
                    && a.owner_id == Some(owner_id)
                    && a.currency == currency
            })
            .cloned())
    }

    async fn append_posting(
        &self,
        posting: &LedgerPosting,
        entries: &[LedgerEntry],
    ) -> Result<Inserted<LedgerPosting>, StoreError> {
        let mut state = self.inner.write().map_err(|_| StoreError::poisoned("ledger"))?;

        let key = posting.key();
        if let Some(existing) = state.postings.get(&key) {
            return Ok(Inserted::Existing(existing.clone()));
        }

        state.postings.insert(key, posting.clone());
        state
            .entries
            .insert((posting.org_id, posting.id), entries.to_vec());

        let now = Utc::now();
        for entry in entries {
            state
                .balances
                .entry((entry.org_id, entry.account_id, entry.currency))
                .or_insert_with(|| AccountBalance::empty(entry.org_id, entry.account_id, entry.currency, now))
                .apply(entry);
        }

        Ok(Inserted::New(posting.clone()))
    }

    async fn posting(&self, key: &PostingKey) -> Result<Option<LedgerPosting>, StoreError> {
        let state = self.inner.read().map_err(|_| StoreError::poisoned("ledger"))?;
        Ok(state.postings.get(key).cloned())
    }

    async fn entries(&self, org_id: OrgId, posting_id: PostingId) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.inner.read().map_err(|_| StoreError::poisoned("ledger"))?;
        Ok(state.entries.get(&(org_id, posting_id)).cloned().unwrap_or_default())
    }

    async fn balance(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let state = self.inner.read().map_err(|_| StoreError::poisoned("ledger"))?;
        Ok(state.balances.get(&(org_id, account_id, currency)).cloned())
    }
}
