use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use waypost_core::{Currency, OrgId};
use waypost_fx::{FxRate, FxRateSnapshot, SnapshotKey};

use super::{doc_of, is_unique_violation, map_sqlx_error, to_doc};
use crate::store::{FxStore, Inserted, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresFxStore {
    pool: Arc<PgPool>,
}

impl PostgresFxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl FxStore for PostgresFxStore {
    async fn insert_rate(&self, rate: &FxRate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fx_rates (org_id, base, quote, as_of, source, rate, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, base, quote, as_of, source)
            DO UPDATE SET rate = EXCLUDED.rate, doc = EXCLUDED.doc
            "#,
        )
        .bind(rate.org_id.as_uuid())
        .bind(rate.base.code())
        .bind(rate.quote.code())
        .bind(rate.as_of)
        .bind(&rate.source)
        .bind(rate.rate)
        .bind(to_doc(rate)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_rate", e))?;
        Ok(())
    }

    async fn latest_rate(
        &self,
        org_id: OrgId,
        base: Currency,
        quote: Currency,
        at: DateTime<Utc>,
    ) -> Result<Option<FxRate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM fx_rates
            WHERE org_id = $1 AND base = $2 AND quote = $3 AND as_of <= $4
            ORDER BY as_of DESC
            LIMIT 1
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(base.code())
        .bind(quote.code())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_rate", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn snapshot(&self, key: &SnapshotKey) -> Result<Option<FxRateSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM fx_snapshots
            WHERE org_id = $1 AND context_type = $2 AND context_id = $3 AND base = $4 AND quote = $5
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.context.kind())
        .bind(key.context.id())
        .bind(key.base.code())
        .bind(key.quote.code())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn insert_snapshot(&self, snapshot: &FxRateSnapshot) -> Result<Inserted<FxRateSnapshot>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO fx_snapshots (org_id, context_type, context_id, base, quote, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.org_id.as_uuid())
        .bind(snapshot.context.kind())
        .bind(snapshot.context.id())
        .bind(snapshot.base.code())
        .bind(snapshot.quote.code())
        .bind(to_doc(snapshot)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(Inserted::New(snapshot.clone())),
            Err(e) if is_unique_violation(&e) => self
                .snapshot(&snapshot.key())
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Conflict("fx snapshot raced".to_string())),
            Err(e) => Err(map_sqlx_error("insert_snapshot", e)),
        }
    }
}
