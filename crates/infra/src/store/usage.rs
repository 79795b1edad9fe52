use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use waypost_billing::{BillingPeriod, TenantPlan, UsageKey, UsageLedgerRecord};
use waypost_core::TenantId;

use super::{Inserted, StoreError};

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn plan(&self, tenant_id: TenantId) -> Result<Option<TenantPlan>, StoreError>;

    async fn upsert(&self, plan: &TenantPlan) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Unique on `(tenant_id, metric, source_event_id)`.
    async fn insert_usage(&self, record: &UsageLedgerRecord) -> Result<Inserted<UsageLedgerRecord>, StoreError>;

    /// Records not yet settled whose `occurred_at` falls in `period`, across tenants.
    async fn unbilled(&self, period: BillingPeriod) -> Result<Vec<UsageLedgerRecord>, StoreError>;

    /// Included units already absorbed by planned records of one tenant
    /// metric in `period`, settled or not.
    async fn quota_consumed(&self, tenant_id: TenantId, metric: &str, period: BillingPeriod) -> Result<u64, StoreError>;

    /// Persist `planned_quantity`. Only applies while the stored row is
    /// unbilled and not yet planned; returns whether it was written.
    async fn record_plan(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError>;

    /// Persist a push result. Only applies while the stored row is still
    /// unbilled; returns whether it was written.
    async fn record_push_result(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    inner: RwLock<HashMap<TenantId, TenantPlan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn plan(&self, tenant_id: TenantId) -> Result<Option<TenantPlan>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("plans"))?;
        Ok(map.get(&tenant_id).cloned())
    }

    async fn upsert(&self, plan: &TenantPlan) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("plans"))?;
        map.insert(plan.tenant_id, plan.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    inner: RwLock<HashMap<UsageKey, UsageLedgerRecord>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &UsageKey) -> Option<UsageLedgerRecord> {
        self.inner.read().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn insert_usage(&self, record: &UsageLedgerRecord) -> Result<Inserted<UsageLedgerRecord>, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("usage"))?;
        if let Some(existing) = map.get(&record.key) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        map.insert(record.key.clone(), record.clone());
        Ok(Inserted::New(record.clone()))
    }

    async fn unbilled(&self, period: BillingPeriod) -> Result<Vec<UsageLedgerRecord>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("usage"))?;
        let mut out: Vec<_> = map
            .values()
            .filter(|r| !r.billed && period.contains(r.occurred_at))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));
        Ok(out)
    }

    async fn quota_consumed(&self, tenant_id: TenantId, metric: &str, period: BillingPeriod) -> Result<u64, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("usage"))?;
        Ok(map
            .values()
            .filter(|r| r.tenant_id() == tenant_id && r.metric() == metric && period.contains(r.occurred_at))
            .map(UsageLedgerRecord::covered_quantity)
            .sum())
    }

    async fn record_plan(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("usage"))?;
        match map.get_mut(&record.key) {
            Some(stored) if !stored.billed && stored.planned_quantity.is_none() => {
                stored.planned_quantity = record.planned_quantity;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("usage record {}", record.id))),
        }
    }

    async fn record_push_result(&self, record: &UsageLedgerRecord) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("usage"))?;
        match map.get_mut(&record.key) {
            Some(stored) if !stored.billed => {
                *stored = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("usage record {}", record.id))),
        }
    }
}
