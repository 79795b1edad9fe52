use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use waypost_billing::{BillingPeriod, FinalizeStatus, PeriodClaim, PeriodFinalizeRecord};

use super::StoreError;

/// Period lock documents of the monthly finalize run.
#[async_trait]
pub trait FinalizeStore: Send + Sync {
    /// Atomically create or take over the period's lock document.
    async fn claim(
        &self,
        period: BillingPeriod,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<PeriodClaim, StoreError>;

    /// Write the terminal state of a run. Only the current owner may complete.
    async fn complete(&self, record: &PeriodFinalizeRecord) -> Result<(), StoreError>;

    async fn get(&self, period: BillingPeriod) -> Result<Option<PeriodFinalizeRecord>, StoreError>;

    /// Periods before `before` whose last run did not succeed, oldest first.
    async fn unfinished(&self, before: BillingPeriod) -> Result<Vec<PeriodFinalizeRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFinalizeStore {
    inner: Mutex<HashMap<BillingPeriod, PeriodFinalizeRecord>>,
}

impl InMemoryFinalizeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FinalizeStore for InMemoryFinalizeStore {
    async fn claim(
        &self,
        period: BillingPeriod,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<PeriodClaim, StoreError> {
        let mut map = self.inner.lock().map_err(|_| StoreError::poisoned("finalize"))?;
        let claim = match map.get(&period) {
            None => PeriodClaim::Claimed(PeriodFinalizeRecord::new_claim(period, owner, now, lease)),
            Some(existing) => existing.claim(owner, now, lease),
        };
        if let PeriodClaim::Claimed(record) = &claim {
            map.insert(period, record.clone());
        }
        Ok(claim)
    }

    async fn complete(&self, record: &PeriodFinalizeRecord) -> Result<(), StoreError> {
        let mut map = self.inner.lock().map_err(|_| StoreError::poisoned("finalize"))?;
        match map.get_mut(&record.period) {
            Some(stored) if stored.owner == record.owner => {
                *stored = record.clone();
                Ok(())
            }
            Some(stored) => Err(StoreError::Conflict(format!(
                "period {} is owned by {}",
                record.period, stored.owner
            ))),
            None => Err(StoreError::NotFound(format!("period {}", record.period))),
        }
    }

    async fn get(&self, period: BillingPeriod) -> Result<Option<PeriodFinalizeRecord>, StoreError> {
        let map = self.inner.lock().map_err(|_| StoreError::poisoned("finalize"))?;
        Ok(map.get(&period).cloned())
    }

    async fn unfinished(&self, before: BillingPeriod) -> Result<Vec<PeriodFinalizeRecord>, StoreError> {
        let map = self.inner.lock().map_err(|_| StoreError::poisoned("finalize"))?;
        let mut records: Vec<_> = map
            .values()
            .filter(|r| r.period < before && r.status != FinalizeStatus::Success)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.period);
        Ok(records)
    }
}
