use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use waypost_core::{AgencyId, OrgId};

use super::map_sqlx_error;
use crate::credit_guard::{AgencyLockGuard, AgencyLocks};
use crate::store::StoreError;

/// Cross-process agency locks on Postgres transaction-scoped advisory locks.
///
/// The guard owns the open transaction; dropping it rolls back, which
/// releases the lock.
#[derive(Debug, Clone)]
pub struct PgAgencyLocks {
    pool: Arc<PgPool>,
}

impl PgAgencyLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

pub(crate) fn lock_key(org_id: OrgId, agency_id: AgencyId) -> String {
    format!("credit:{org_id}:{agency_id}")
}

#[async_trait]
impl AgencyLocks for PgAgencyLocks {
    async fn acquire(&self, org_id: OrgId, agency_id: AgencyId) -> Result<AgencyLockGuard, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("agency_lock.begin", e))?;
        let key = lock_key(org_id, agency_id);
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("agency_lock.acquire", e))?;
        debug!(%key, "agency lock acquired");
        Ok(AgencyLockGuard::new(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_scoped_by_org_and_agency() {
        let org = OrgId::new();
        let a = AgencyId::new();
        let b = AgencyId::new();
        assert_ne!(lock_key(org, a), lock_key(org, b));
        assert!(lock_key(org, a).starts_with("credit:"));
    }
}
