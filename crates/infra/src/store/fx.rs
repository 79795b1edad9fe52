use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use waypost_core::{Currency, OrgId};
use waypost_fx::{FxRate, FxRateSnapshot, SnapshotKey, latest_at};

use super::{Inserted, StoreError};

#[async_trait]
pub trait FxStore: Send + Sync {
    async fn insert_rate(&self, rate: &FxRate) -> Result<(), StoreError>;

    /// Greatest `as_of <= at` for the pair within `org_id`.
    async fn latest_rate(
        &self,
        org_id: OrgId,
        base: Currency,
        quote: Currency,
        at: DateTime<Utc>,
    ) -> Result<Option<FxRate>, StoreError>;

    async fn snapshot(&self, key: &SnapshotKey) -> Result<Option<FxRateSnapshot>, StoreError>;

    /// Unique on the snapshot key; the first writer wins.
    async fn insert_snapshot(&self, snapshot: &FxRateSnapshot) -> Result<Inserted<FxRateSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFxStore {
    rates: RwLock<HashMap<OrgId, Vec<FxRate>>>,
    snapshots: RwLock<HashMap<SnapshotKey, FxRateSnapshot>>,
}

impl InMemoryFxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FxStore for InMemoryFxStore {
    async fn insert_rate(&self, rate: &FxRate) -> Result<(), StoreError> {
        let mut rates = self.rates.write().map_err(|_| StoreError::poisoned("fx rates"))?;
        let list = rates.entry(rate.org_id).or_default();
        // (pair, as_of, source) identifies a rate; re-imports replace it.
        list.retain(|r| !(r.base == rate.base && r.quote == rate.quote && r.as_of == rate.as_of && r.source == rate.source));
        list.push(rate.clone());
        Ok(())
    }

    async fn latest_rate(
        &self,
        org_id: OrgId,
        base: Currency,
        quote: Currency,
        at: DateTime<Utc>,
    ) -> Result<Option<FxRate>, StoreError> {
        let rates = self.rates.read().map_err(|_| StoreError::poisoned("fx rates"))?;
        Ok(rates
            .get(&org_id)
            .and_then(|list| latest_at(list.iter(), base, quote, at))
            .cloned())
    }

    async fn snapshot(&self, key: &SnapshotKey) -> Result<Option<FxRateSnapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::poisoned("fx snapshots"))?;
        Ok(snapshots.get(key).cloned())
    }

    async fn insert_snapshot(&self, snapshot: &FxRateSnapshot) -> Result<Inserted<FxRateSnapshot>, StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| StoreError::poisoned("fx snapshots"))?;
        let key = snapshot.key();
        if let Some(existing) = snapshots.get(&key) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        snapshots.insert(key, snapshot.clone());
        Ok(Inserted::New(snapshot.clone()))
    }
}
