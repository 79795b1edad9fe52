use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use waypost_billing::{BillingPeriod, PeriodClaim, PeriodFinalizeRecord};

use super::{doc_of, map_sqlx_error, to_doc};
use crate::store::{FinalizeStore, StoreError};

/// Period lock documents. Claims run under `SELECT .. FOR UPDATE` so two
/// workers can never both see the lock as free.
#[derive(Debug, Clone)]
pub struct PostgresFinalizeStore {
    pool: Arc<PgPool>,
}

impl PostgresFinalizeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

async fn write(
    tx: &mut Transaction<'static, Postgres>,
    record: &PeriodFinalizeRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE period_finalize SET status = $2, owner = $3, lease_until = $4, doc = $5
        WHERE period = $1
        "#,
    )
    .bind(record.period.label())
    .bind(record.status.as_str())
    .bind(&record.owner)
    .bind(record.lease_until)
    .bind(to_doc(record)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("finalize.write", e))?;
    Ok(())
}

#[async_trait]
impl FinalizeStore for PostgresFinalizeStore {
    #[instrument(skip(self, now), fields(period = %period), err)]
    async fn claim(
        &self,
        period: BillingPeriod,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<PeriodClaim, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("finalize.claim.begin", e))?;

        let fresh = PeriodFinalizeRecord::new_claim(period, owner, now, lease);
        let inserted = sqlx::query(
            r#"
            INSERT INTO period_finalize (period, status, owner, lease_until, doc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (period) DO NOTHING
            "#,
        )
        .bind(period.label())
        .bind(fresh.status.as_str())
        .bind(&fresh.owner)
        .bind(fresh.lease_until)
        .bind(to_doc(&fresh)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finalize.claim.insert", e))?;

        let claim = if inserted.rows_affected() == 1 {
            PeriodClaim::Claimed(fresh)
        } else {
            let row = sqlx::query("SELECT doc FROM period_finalize WHERE period = $1 FOR UPDATE")
                .bind(period.label())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("finalize.claim.select", e))?;
            let stored: PeriodFinalizeRecord = doc_of(&row)?;
            let claim = stored.claim(owner, now, lease);
            if let PeriodClaim::Claimed(record) = &claim {
                write(&mut tx, record).await?;
            }
            claim
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("finalize.claim.commit", e))?;
        Ok(claim)
    }

    async fn complete(&self, record: &PeriodFinalizeRecord) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("finalize.complete.begin", e))?;
        let row = sqlx::query("SELECT owner FROM period_finalize WHERE period = $1 FOR UPDATE")
            .bind(record.period.label())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("finalize.complete.select", e))?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("period {}", record.period)));
        };
        let stored_owner: String = sqlx::Row::try_get(&row, "owner")
            .map_err(|e| map_sqlx_error("finalize.complete.select", e))?;
        if stored_owner != record.owner {
            return Err(StoreError::Conflict(format!(
                "period {} is owned by {}",
                record.period, stored_owner
            )));
        }
        write(&mut tx, record).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("finalize.complete.commit", e))
    }

    async fn get(&self, period: BillingPeriod) -> Result<Option<PeriodFinalizeRecord>, StoreError> {
        let row = sqlx::query("SELECT doc FROM period_finalize WHERE period = $1")
            .bind(period.label())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finalize.get", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn unfinished(&self, before: BillingPeriod) -> Result<Vec<PeriodFinalizeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM period_finalize WHERE period < $1 AND status <> 'success' ORDER BY period",
        )
        .bind(before.label())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize.unfinished", e))?;
        rows.iter().map(doc_of).collect()
    }
}
