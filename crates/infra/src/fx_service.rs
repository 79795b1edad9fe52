//! Dated rate lookup and per-context rate freezing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use waypost_core::{Amount, ContextRef, Currency, OrgId, Outcome};
use waypost_events::{AuditScope, AuditSink, emit};
use waypost_fx::{FxError, FxEvent, FxRate, FxRateSnapshot, SnapshotKey, convert};

use crate::error::EngineError;
use crate::store::{FxStore, Inserted};

#[derive(Clone)]
pub struct FxSnapshotService {
    store: Arc<dyn FxStore>,
    audit: Arc<dyn AuditSink>,
}

impl FxSnapshotService {
    pub fn new(store: Arc<dyn FxStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Entry point for the external rate feeder.
    pub async fn record_rate(&self, rate: &FxRate) -> Result<(), EngineError> {
        self.store.insert_rate(rate).await?;
        debug!(org_id = %rate.org_id, pair = %format!("{}/{}", rate.base, rate.quote), as_of = %rate.as_of, "fx rate recorded");
        Ok(())
    }

    /// Latest rate not after `as_of`. There is no fallback rate.
    pub async fn resolve_rate(
        &self,
        org_id: OrgId,
        base: Currency,
        quote: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<FxRate, EngineError> {
        self.store
            .latest_rate(org_id, base, quote, as_of)
            .await?
            .ok_or_else(|| FxError::RateNotFound { base, quote, as_of }.into())
    }

    /// The snapshot frozen for `context`, creating it from the current rate
    /// on first use. Later callers get the stored snapshot even if the rate
    /// table has moved on.
    #[instrument(skip(self, context), fields(context = %context), err)]
    pub async fn snapshot_for_context(
        &self,
        org_id: OrgId,
        context: ContextRef,
        base: Currency,
        quote: Currency,
    ) -> Result<Outcome<FxRateSnapshot>, EngineError> {
        let key = SnapshotKey {
            org_id,
            context,
            base,
            quote,
        };
        if let Some(existing) = self.store.snapshot(&key).await? {
            return Ok(Outcome::AlreadyApplied(existing));
        }

        let now = Utc::now();
        let candidate = if base == quote {
            FxRateSnapshot::identity(key, now)
        } else {
            let rate = self.resolve_rate(org_id, base, quote, now).await?;
            FxRateSnapshot::freeze(key, &rate, now)
        };

        match self.store.insert_snapshot(&candidate).await? {
            Inserted::New(snapshot) => {
                info!(snapshot_id = %snapshot.id, rate = %snapshot.rate, source = %snapshot.rate_source, "fx snapshot frozen");
                emit(
                    self.audit.as_ref(),
                    AuditScope::Org(org_id),
                    snapshot.context.to_string(),
                    &FxEvent::SnapshotFrozen {
                        snapshot_id: snapshot.id,
                        context: snapshot.context.clone(),
                        base: snapshot.base,
                        quote: snapshot.quote,
                        rate: snapshot.rate,
                        occurred_at: now,
                    },
                );
                Ok(Outcome::Applied(snapshot))
            }
            Inserted::Existing(snapshot) => {
                debug!(snapshot_id = %snapshot.id, "snapshot race lost; using stored snapshot");
                Ok(Outcome::AlreadyApplied(snapshot))
            }
        }
    }

    pub fn convert(&self, amount: Amount, currency: Currency, snapshot: &FxRateSnapshot) -> Result<Amount, EngineError> {
        Ok(convert(amount, currency, snapshot)?)
    }
}
