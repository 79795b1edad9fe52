use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use waypost_core::{AgencyId, OrgId};
use waypost_credit::CreditProfile;

use super::{doc_of, map_sqlx_error, to_doc};
use crate::store::{CreditProfileStore, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresCreditProfileStore {
    pool: Arc<PgPool>,
}

impl PostgresCreditProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl CreditProfileStore for PostgresCreditProfileStore {
    async fn profile(&self, org_id: OrgId, agency_id: AgencyId) -> Result<Option<CreditProfile>, StoreError> {
        let row = sqlx::query("SELECT doc FROM credit_profiles WHERE org_id = $1 AND agency_id = $2")
            .bind(org_id.as_uuid())
            .bind(agency_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("credit_profile", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn upsert(&self, profile: &CreditProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credit_profiles (org_id, agency_id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (org_id, agency_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(profile.org_id.as_uuid())
        .bind(profile.agency_id.as_uuid())
        .bind(to_doc(profile)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_credit_profile", e))?;
        Ok(())
    }
}
