use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use waypost_core::{AgencyId, OrgId};
use waypost_credit::CreditProfile;

use super::StoreError;

#[async_trait]
pub trait CreditProfileStore: Send + Sync {
    async fn profile(&self, org_id: OrgId, agency_id: AgencyId) -> Result<Option<CreditProfile>, StoreError>;

    async fn upsert(&self, profile: &CreditProfile) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCreditProfileStore {
    inner: RwLock<HashMap<(OrgId, AgencyId), CreditProfile>>,
}

impl InMemoryCreditProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditProfileStore for InMemoryCreditProfileStore {
    async fn profile(&self, org_id: OrgId, agency_id: AgencyId) -> Result<Option<CreditProfile>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("credit profiles"))?;
        Ok(map.get(&(org_id, agency_id)).cloned())
    }

    async fn upsert(&self, profile: &CreditProfile) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("credit profiles"))?;
        map.insert((profile.org_id, profile.agency_id), profile.clone());
        Ok(())
    }
}
