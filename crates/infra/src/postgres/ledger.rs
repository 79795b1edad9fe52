use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use waypost_core::{AccountId, Currency, OrgId, PostingId};
use waypost_ledger::{
    Account, AccountBalance, AccountStatus, AccountType, Direction, LedgerEntry, LedgerPosting, PostingKey,
};

use super::{doc_of, is_unique_violation, map_sqlx_error, to_doc, to_u64};
use crate::store::{Inserted, LedgerStore, StoreError};

/// Ledger tables. Every query is scoped by `org_id`.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn account_by_code(&self, org_id: OrgId, code: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query("SELECT doc FROM ledger_accounts WHERE org_id = $1 AND code = $2")
            .bind(org_id.as_uuid())
            .bind(code)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_by_code", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, account), fields(org_id = %account.org_id, code = %account.code), err)]
    async fn insert_account(&self, account: &Account) -> Result<Inserted<Account>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_accounts
                (org_id, id, code, account_type, owner_id, currency, status, doc, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(account.org_id.as_uuid())
        .bind(account.id.as_uuid())
        .bind(&account.code)
        .bind(account.account_type.as_str())
        .bind(account.owner_id)
        .bind(account.currency.code())
        .bind(account.status.as_str())
        .bind(to_doc(account)?)
        .bind(account.created_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(Inserted::New(account.clone())),
            Err(e) if is_unique_violation(&e) => self
                .account_by_code(account.org_id, &account.code)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Conflict(format!("account code {} raced", account.code))),
            Err(e) => Err(map_sqlx_error("insert_account", e)),
        }
    }

    async fn set_account_status(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET status = $3, doc = jsonb_set(doc, '{status}', to_jsonb($3::text))
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(account_id.as_uuid())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_account_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    async fn accounts(&self, org_id: OrgId, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query("SELECT doc FROM ledger_accounts WHERE org_id = $1 AND id = ANY($2)")
            .bind(org_id.as_uuid())
            .bind(&uuids)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("accounts", e))?;
        rows.into_iter()
            .map(|r| doc_of::<Account>(&r).map(|a| (a.id, a)))
            .collect()
    }

    async fn find_account(
        &self,
        org_id: OrgId,
        account_type: AccountType,
        owner_id: Uuid,
        currency: Currency,
    ) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM ledger_accounts
            WHERE org_id = $1 AND account_type = $2 AND owner_id = $3 AND currency = $4
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(account_type.as_str())
        .bind(owner_id)
        .bind(currency.code())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_account", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    /// Header, entries and balance upserts in one transaction. A unique
    /// violation on the header rolls everything back and returns the winner.
    #[instrument(skip(self, posting, entries), fields(key = %posting.key(), entries = entries.len()), err)]
    async fn append_posting(
        &self,
        posting: &LedgerPosting,
        entries: &[LedgerEntry],
    ) -> Result<Inserted<LedgerPosting>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("append_posting.begin", e))?;

        let header = sqlx::query(
            r#"
            INSERT INTO ledger_postings (org_id, id, source_type, source_id, event, doc, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(posting.org_id.as_uuid())
        .bind(posting.id.as_uuid())
        .bind(posting.source.kind())
        .bind(posting.source.id())
        .bind(&posting.event)
        .bind(to_doc(posting)?)
        .bind(posting.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = header {
            if is_unique_violation(&e) {
                drop(tx);
                debug!("posting key already present");
                return self
                    .posting(&posting.key())
                    .await?
                    .map(Inserted::Existing)
                    .ok_or_else(|| StoreError::Conflict(format!("posting {} raced", posting.key())));
            }
            return Err(map_sqlx_error("append_posting.header", e));
        }

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries
                    (org_id, id, posting_id, account_id, currency, direction, amount, doc, posted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(entry.org_id.as_uuid())
            .bind(entry.id.as_uuid())
            .bind(entry.posting_id.as_uuid())
            .bind(entry.account_id.as_uuid())
            .bind(entry.currency.code())
            .bind(entry.direction.as_str())
            .bind(entry.amount.value())
            .bind(to_doc(entry)?)
            .bind(entry.posted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_posting.entry", e))?;

            let (debit, credit) = match entry.direction {
                Direction::Debit => (entry.amount.value(), Decimal::ZERO),
                Direction::Credit => (Decimal::ZERO, entry.amount.value()),
            };
            sqlx::query(
                r#"
                INSERT INTO account_balances
                    (org_id, account_id, currency, debit_total, credit_total, entry_count, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, $6)
                ON CONFLICT (org_id, account_id, currency) DO UPDATE SET
                    debit_total  = account_balances.debit_total + EXCLUDED.debit_total,
                    credit_total = account_balances.credit_total + EXCLUDED.credit_total,
                    entry_count  = account_balances.entry_count + 1,
                    updated_at   = GREATEST(account_balances.updated_at, EXCLUDED.updated_at)
                "#,
            )
            .bind(entry.org_id.as_uuid())
            .bind(entry.account_id.as_uuid())
            .bind(entry.currency.code())
            .bind(debit)
            .bind(credit)
            .bind(entry.posted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_posting.balance", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append_posting.commit", e))?;
        Ok(Inserted::New(posting.clone()))
    }

    async fn posting(&self, key: &PostingKey) -> Result<Option<LedgerPosting>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM ledger_postings WHERE org_id = $1 AND source_type = $2 AND source_id = $3 AND event = $4",
        )
        .bind(key.org_id.as_uuid())
        .bind(key.source.kind())
        .bind(key.source.id())
        .bind(&key.event)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("posting", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn entries(&self, org_id: OrgId, posting_id: PostingId) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM ledger_entries
            WHERE org_id = $1 AND posting_id = $2
            ORDER BY posted_at ASC, id ASC
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(posting_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries", e))?;
        rows.iter().map(doc_of).collect()
    }

    async fn balance(
        &self,
        org_id: OrgId,
        account_id: AccountId,
        currency: Currency,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT debit_total, credit_total, entry_count, updated_at
            FROM account_balances
            WHERE org_id = $1 AND account_id = $2 AND currency = $3
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(account_id.as_uuid())
        .bind(currency.code())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let count: i64 = row.try_get("entry_count").map_err(|e| map_sqlx_error("balance", e))?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(|e| map_sqlx_error("balance", e))?;
        Ok(Some(AccountBalance {
            org_id,
            account_id,
            currency,
            debit_total: row.try_get("debit_total").map_err(|e| map_sqlx_error("balance", e))?,
            credit_total: row.try_get("credit_total").map_err(|e| map_sqlx_error("balance", e))?,
            entry_count: to_u64(count, "entry_count")?,
            updated_at,
        }))
    }
}
