use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use waypost_billing::{BillingPeriod, TenantPlan, UsageLedgerRecord};
use waypost_core::TenantId;

use super::{doc_of, is_unique_violation, map_sqlx_error, to_doc, to_i64, to_u64};
use crate::store::{Inserted, PlanStore, StoreError, UsageStore};

#[derive(Debug, Clone)]
pub struct PostgresPlanStore {
    pool: Arc<PgPool>,
}

impl PostgresPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl PlanStore for PostgresPlanStore {
    async fn plan(&self, tenant_id: TenantId) -> Result<Option<TenantPlan>, StoreError> {
        let row = sqlx::query("SELECT doc FROM tenant_plans WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("plan", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn upsert(&self, plan: &TenantPlan) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_plans (tenant_id, doc) VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(plan.tenant_id.as_uuid())
        .bind(to_doc(plan)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_plan", e))?;
        Ok(())
    }
}

/// Usage rows, unique on `(tenant_id, metric, source_event_id)`.
#[derive(Debug, Clone)]
pub struct PostgresUsageStore {
    pool: Arc<PgPool>,
}

impl PostgresUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn by_key(&self, record: &UsageLedgerRecord) -> Result<Option<UsageLedgerRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM usage_records WHERE tenant_id = $1 AND metric = $2 AND source_event_id = $3",
        )
        .bind(record.key.tenant_id.as_uuid())
        .bind(&record.key.metric)
        .bind(&record.key.source_event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_by_key", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    async fn insert_usage(&self, record: &UsageLedgerRecord) -> Result<Inserted<UsageLedgerRecord>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records
                (tenant_id, metric, source_event_id, id, quantity, occurred_at, billed, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.key.tenant_id.as_uuid())
        .bind(&record.key.metric)
        .bind(&record.key.source_event_id)
        .bind(record.id.as_uuid())
        .bind(to_i64(record.quantity, "quantity")?)
        .bind(record.occurred_at)
        .bind(record.billed)
        .bind(to_doc(record)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(Inserted::New(record.clone())),
            Err(e) if is_unique_violation(&e) => self
                .by_key(record)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Conflict(format!("usage record {} raced", record.id))),
            Err(e) => Err(map_sqlx_error("insert_usage", e)),
        }
    }

    async fn unbilled(&self, period: BillingPeriod) -> Result<Vec<UsageLedgerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM usage_records
            WHERE NOT billed AND occurred_at >= $1 AND occurred_at < $2
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(period.start())
        .bind(period.end())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unbilled", e))?;
        rows.iter().map(doc_of).collect()
    }

    async fn quota_consumed(&self, tenant_id: TenantId, metric: &str, period: BillingPeriod) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity - planned_quantity), 0)::BIGINT AS total
            FROM usage_records
            WHERE planned_quantity IS NOT NULL
              AND tenant_id = $1 AND metric = $2 AND occurred_at >= $3 AND occurred_at < $4
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(metric)
        .bind(period.start())
        .bind(period.end())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quota_consumed", e))?;
        let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("quota_consumed", e))?;
        to_u64(total, "consumed quota")
    }

    async fn record_plan(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError> {
        let Some(planned) = record.planned_quantity else {
            return Ok(false);
        };
        let result = sqlx::query(
            r#"
            UPDATE usage_records SET planned_quantity = $4, doc = $5
            WHERE tenant_id = $1 AND metric = $2 AND source_event_id = $3
              AND NOT billed AND planned_quantity IS NULL
            "#,
        )
        .bind(record.key.tenant_id.as_uuid())
        .bind(&record.key.metric)
        .bind(&record.key.source_event_id)
        .bind(to_i64(planned, "planned_quantity")?)
        .bind(to_doc(record)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_plan", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.by_key(record).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("usage record {}", record.id))),
        }
    }

    async fn record_push_result(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE usage_records SET billed = $4, doc = $5
            WHERE tenant_id = $1 AND metric = $2 AND source_event_id = $3 AND NOT billed
            "#,
        )
        .bind(record.key.tenant_id.as_uuid())
        .bind(&record.key.metric)
        .bind(&record.key.source_event_id)
        .bind(record.billed)
        .bind(to_doc(record)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_push_result", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.by_key(record).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("usage record {}", record.id))),
        }
    }
}
