//! Usage metering, provider pushes and provider event reconciliation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument, warn};

use waypost_billing::{
    BillingError, BillingEvent, BillingPeriod, BillingSubscription, BookingPayment, CasOutcome, FinalizeSummary,
    MetricPrice, NewUsage, PaymentStatus, ProviderAction, ProviderEvent, PushMode, PushPlan, PushStatus, SubscriptionUpdate,
    TenantPlan, UsageLedgerRecord, WebhookDecision, WebhookEventRecord, interpret, plan_pushes,
};
use waypost_core::{Outcome, RejectionKind, TenantId};
use waypost_events::{AuditScope, AuditSink, emit};

use crate::error::EngineError;
use crate::postgres::{
    PostgresPaymentStore, PostgresPlanStore, PostgresSubscriptionStore, PostgresUsageStore, PostgresWebhookEventStore,
};
use crate::provider::{BillingProvider, UsagePush};
use crate::retry::{RetryPolicy, retry};
use crate::store::{
    Claim, InMemoryPaymentStore, InMemoryPlanStore, InMemorySubscriptionStore, InMemoryUsageStore,
    InMemoryWebhookEventStore, PaymentStore, PlanStore, StoreError, SubscriptionStore, UsageStore, WebhookEventStore,
};

/// Lost compare-and-set races are retried this many times before erroring,
/// backing off per the bridge's retry policy.
const CAS_ATTEMPTS: u32 = 3;

/// Stores the bridge reads and writes.
#[derive(Clone)]
pub struct BillingStores {
    pub plans: Arc<dyn PlanStore>,
    pub usage: Arc<dyn UsageStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub webhooks: Arc<dyn WebhookEventStore>,
}

impl BillingStores {
    pub fn in_memory() -> Self {
        Self {
            plans: Arc::new(InMemoryPlanStore::new()),
            usage: Arc::new(InMemoryUsageStore::new()),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            webhooks: Arc::new(InMemoryWebhookEventStore::new()),
        }
    }

    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            plans: Arc::new(PostgresPlanStore::new(pool.clone())),
            usage: Arc::new(PostgresUsageStore::new(pool.clone())),
            subscriptions: Arc::new(PostgresSubscriptionStore::new(pool.clone())),
            payments: Arc::new(PostgresPaymentStore::new(pool.clone())),
            webhooks: Arc::new(PostgresWebhookEventStore::new(pool.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    /// Grace window opened when a subscription enters `past_due`.
    pub grace: Duration,
    /// An undecided webhook claim older than this may be taken over.
    pub webhook_stale_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            grace: Duration::days(7),
            webhook_stale_after: Duration::minutes(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts of one `push_unbilled` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PushReport {
    pub pushed: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl From<PushReport> for FinalizeSummary {
    fn from(r: PushReport) -> Self {
        FinalizeSummary {
            pushed: r.pushed,
            skipped: r.skipped,
            failed: r.failed,
        }
    }
}

#[derive(Clone)]
pub struct BillingBridge {
    stores: BillingStores,
    provider: Arc<dyn BillingProvider>,
    audit: Arc<dyn AuditSink>,
    settings: BridgeSettings,
}

impl BillingBridge {
    pub fn new(
        stores: BillingStores,
        provider: Arc<dyn BillingProvider>,
        audit: Arc<dyn AuditSink>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            stores,
            provider,
            audit,
            settings,
        }
    }

    pub fn stores(&self) -> &BillingStores {
        &self.stores
    }

    pub async fn upsert_plan(&self, plan: &TenantPlan) -> Result<(), EngineError> {
        Ok(self.stores.plans.upsert(plan).await?)
    }

    pub async fn register_subscription(
        &self,
        sub: &BillingSubscription,
    ) -> Result<Outcome<BillingSubscription>, EngineError> {
        Ok(self.stores.subscriptions.insert(sub).await?.into_outcome())
    }

    pub async fn register_payment(&self, payment: &BookingPayment) -> Result<Outcome<BookingPayment>, EngineError> {
        Ok(self.stores.payments.insert(payment).await?.into_outcome())
    }

    /// Record usage once per `(tenant, metric, source_event_id)`. Tenants on a
    /// non-metered tier are rejected with nothing written.
    #[instrument(skip(self, usage), fields(tenant_id = %usage.key.tenant_id, metric = %usage.key.metric), err)]
    pub async fn track_usage(&self, usage: NewUsage) -> Result<Outcome<UsageLedgerRecord>, EngineError> {
        let tenant_id = usage.key.tenant_id;
        match self.stores.plans.plan(tenant_id).await? {
            Some(plan) if plan.metered => {}
            Some(plan) => {
                debug!(tier = %plan.tier, "tier is not metered; usage dropped");
                return Ok(Outcome::rejected(
                    RejectionKind::NotMetered,
                    format!("tier '{}' is not metered", plan.tier),
                ));
            }
            None => {
                return Ok(Outcome::rejected(RejectionKind::NotMetered, "tenant has no billing plan"));
            }
        }

        let record = usage.into_record(Utc::now());
        let outcome = self.stores.usage.insert_usage(&record).await?.into_outcome();
        if outcome.is_already_applied() {
            debug!(source_event_id = %record.key.source_event_id, "usage already recorded");
        }
        Ok(outcome)
    }

    /// Push every unsettled record of `period` to the provider. A failing
    /// record is marked and counted; the others proceed.
    #[instrument(skip(self, period), fields(period = %period), err)]
    pub async fn push_unbilled(&self, period: BillingPeriod) -> Result<PushReport, EngineError> {
        let records = self.stores.usage.unbilled(period).await?;
        let mut groups: BTreeMap<(TenantId, String), Vec<UsageLedgerRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry((record.tenant_id(), record.metric().to_string()))
                .or_default()
                .push(record);
        }

        let mut report = PushReport::default();
        for ((tenant_id, metric), group) in groups {
            self.push_group(period, tenant_id, &metric, group, &mut report).await;
        }

        info!(pushed = report.pushed, skipped = report.skipped, failed = report.failed, "usage push finished");
        Ok(report)
    }

    async fn push_group(
        &self,
        period: BillingPeriod,
        tenant_id: TenantId,
        metric: &str,
        group: Vec<UsageLedgerRecord>,
        report: &mut PushReport,
    ) {
        let (plan, price, consumed) = match self.group_plan(period, tenant_id, metric).await {
            Ok(priced) => priced,
            Err(err) => {
                warn!(%tenant_id, metric, code = err.code(), error = %err, "usage group cannot be priced");
                for mut record in group {
                    record.mark_error(err.to_string(), 0);
                    self.settle(record, report, false).await;
                }
                return;
            }
        };

        let mut by_id: HashMap<_, _> = group.iter().map(|r| (r.id, r)).collect();
        for (id, push_plan) in plan_pushes(plan.mode, &price, consumed, &group) {
            let Some(record) = by_id.remove(&id) else {
                continue;
            };
            let mut record = record.clone();
            let now = Utc::now();

            if plan.mode == PushMode::Real && record.planned_quantity.is_none() {
                record.mark_planned(push_plan.quantity());
                match self.stores.usage.record_plan(&record).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(record_id = %record.id, "record planned concurrently; left for the next run");
                        continue;
                    }
                    Err(err) => {
                        error!(record_id = %record.id, error = %err, "failed to persist push plan");
                        report.failed += 1;
                        continue;
                    }
                }
            }

            match push_plan {
                PushPlan::Skip => {
                    record.mark_skipped(now);
                    self.settle(record, report, true).await;
                }
                PushPlan::Push { quantity, unit_price } => {
                    let push = UsagePush {
                        idempotency_key: record.key.provider_idempotency_key(),
                        tenant_id,
                        metric: metric.to_string(),
                        quantity,
                        unit_price,
                        currency: plan.currency,
                        occurred_at: record.occurred_at,
                    };
                    let provider = &self.provider;
                    let push_ref = &push;
                    let (result, attempts) = retry(&self.settings.retry, move |_| provider.push_usage(push_ref)).await;

                    match result {
                        Ok(provider_ref) => {
                            record.mark_pushed(&provider_ref, quantity, now);
                            emit(
                                self.audit.as_ref(),
                                AuditScope::Tenant(tenant_id),
                                record.id.to_string(),
                                &BillingEvent::UsagePushed {
                                    record_id: record.id,
                                    metric: metric.to_string(),
                                    quantity,
                                    mode: plan.mode,
                                    provider_ref,
                                    occurred_at: now,
                                },
                            );
                            self.settle(record, report, true).await;
                        }
                        Err(err) => {
                            warn!(record_id = %record.id, attempts, code = err.code(), error = %err, "usage push failed");
                            record.mark_error(err.to_string(), attempts);
                            emit(
                                self.audit.as_ref(),
                                AuditScope::Tenant(tenant_id),
                                record.id.to_string(),
                                &BillingEvent::UsagePushFailed {
                                    record_id: record.id,
                                    metric: metric.to_string(),
                                    error: err.to_string(),
                                    occurred_at: now,
                                },
                            );
                            self.settle(record, report, false).await;
                        }
                    }
                }
            }
        }
    }

    /// Plan and price of the group plus the included units already consumed this period.
    async fn group_plan(
        &self,
        period: BillingPeriod,
        tenant_id: TenantId,
        metric: &str,
    ) -> Result<(TenantPlan, MetricPrice, u64), EngineError> {
        let plan = self
            .stores
            .plans
            .plan(tenant_id)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        let price = plan.price(metric)?.clone();
        let consumed = self.stores.usage.quota_consumed(tenant_id, metric, period).await?;
        Ok((plan, price, consumed))
    }

    /// Persist a record's push result and count it. A store failure is
    /// counted as a failed record.
    async fn settle(&self, record: UsageLedgerRecord, report: &mut PushReport, ok: bool) {
        match self.stores.usage.record_push_result(&record).await {
            Ok(true) if ok => match record.push_status {
                PushStatus::Skipped => report.skipped += 1,
                _ => report.pushed += 1,
            },
            Ok(true) => report.failed += 1,
            Ok(false) => debug!(record_id = %record.id, "record settled concurrently; result discarded"),
            Err(err) => {
                error!(record_id = %record.id, error = %err, "failed to persist push result");
                report.failed += 1;
            }
        }
    }

    /// Reconcile one provider event. The returned decision is also persisted
    /// on the event's dedupe record.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    pub async fn apply_provider_event(&self, provider: &str, event: &ProviderEvent) -> Result<WebhookDecision, EngineError> {
        let now = Utc::now();
        let claim = WebhookEventRecord::claim(provider, event, now);
        match self
            .stores
            .webhooks
            .claim(&claim, now, self.settings.webhook_stale_after)
            .await?
        {
            Claim::Duplicate(existing) => {
                debug!(deliveries = existing.deliveries, previous = ?existing.decision, "duplicate provider event");
                return Ok(WebhookDecision::IgnoredDuplicate);
            }
            Claim::Reclaimed(existing) => {
                info!(deliveries = existing.deliveries, "reprocessing provider event");
            }
            Claim::Fresh(_) => {}
        }

        let (decision, detail) = match self.reconcile(provider, event, now).await {
            Ok(result) => result,
            Err(err) => {
                error!(code = err.code(), error = %err, "provider event could not be applied");
                (WebhookDecision::Error, Some(err.to_string()))
            }
        };

        self.stores
            .webhooks
            .record_decision(provider, &event.id, decision, detail.clone())
            .await?;
        emit(
            self.audit.as_ref(),
            AuditScope::System,
            format!("{provider}/{}", event.id),
            &BillingEvent::WebhookDecided {
                provider: provider.to_string(),
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                decision,
                occurred_at: now,
            },
        );
        info!(decision = decision.as_str(), detail = detail.as_deref().unwrap_or(""), "provider event decided");
        Ok(decision)
    }

    async fn reconcile(
        &self,
        provider: &str,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> Result<(WebhookDecision, Option<String>), EngineError> {
        match interpret(event)? {
            ProviderAction::Subscription {
                provider_subscription_id,
                update,
            } => self.apply_subscription(provider, &provider_subscription_id, &update, now).await,
            ProviderAction::Payment { payment_ref, target } => self.apply_payment(&payment_ref, target, now).await,
            ProviderAction::NotFinal { detail } => Ok((WebhookDecision::IgnoredNotFinal, Some(detail))),
            ProviderAction::Unhandled => Ok((
                WebhookDecision::IgnoredNotFinal,
                Some(format!("event type '{}' is not consumed", event.event_type)),
            )),
        }
    }

    async fn apply_subscription(
        &self,
        provider: &str,
        provider_subscription_id: &str,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<(WebhookDecision, Option<String>), EngineError> {
        for attempt in 0..CAS_ATTEMPTS {
            self.cas_backoff(attempt).await;
            let current = self
                .stores
                .subscriptions
                .by_provider_id(provider, provider_subscription_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(provider_subscription_id.to_string()))?;

            let mut next = current.clone();
            match next.apply_update(update, now, self.settings.grace) {
                CasOutcome::Unchanged => return Ok((WebhookDecision::IgnoredDuplicate, None)),
                CasOutcome::OutOfOrder { from, to } => {
                    return Ok((
                        WebhookDecision::IgnoredOutOfOrder,
                        Some(format!("{} -> {}", from.as_str(), to.as_str())),
                    ));
                }
                CasOutcome::Applied { from, to } => {
                    if !self.stores.subscriptions.compare_and_set(&next, current.status).await? {
                        debug!(subscription_id = %current.id, "subscription changed concurrently; retrying");
                        continue;
                    }
                    info!(subscription_id = %next.id, from = from.as_str(), to = to.as_str(), "subscription transitioned");
                    emit(
                        self.audit.as_ref(),
                        AuditScope::Tenant(next.tenant_id),
                        next.id.to_string(),
                        &BillingEvent::SubscriptionTransitioned {
                            subscription_id: next.id,
                            from,
                            to,
                            cancel_at_period_end: next.cancel_at_period_end,
                            occurred_at: now,
                        },
                    );
                    return Ok((WebhookDecision::Applied, None));
                }
            }
        }
        Err(StoreError::Conflict(format!("subscription {provider_subscription_id}")).into())
    }

    async fn apply_payment(
        &self,
        payment_ref: &str,
        target: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<(WebhookDecision, Option<String>), EngineError> {
        for attempt in 0..CAS_ATTEMPTS {
            self.cas_backoff(attempt).await;
            let current = self
                .stores
                .payments
                .by_provider_ref(payment_ref)
                .await?
                .ok_or_else(|| BillingError::PaymentNotFound(payment_ref.to_string()))?;

            let mut next = current.clone();
            match next.transition(target, now) {
                CasOutcome::Unchanged => return Ok((WebhookDecision::IgnoredDuplicate, None)),
                CasOutcome::OutOfOrder { from, to } => {
                    return Ok((WebhookDecision::IgnoredOutOfOrder, Some(format!("{from:?} -> {to:?}"))));
                }
                CasOutcome::Applied { from, to } => {
                    if !self.stores.payments.compare_and_set(&next, current.status).await? {
                        debug!(booking = %current.booking, "payment changed concurrently; retrying");
                        continue;
                    }
                    info!(booking = %next.booking, from = ?from, to = ?to, "booking payment transitioned");
                    emit(
                        self.audit.as_ref(),
                        AuditScope::Org(next.org_id),
                        next.booking.to_string(),
                        &BillingEvent::PaymentStatusChanged {
                            booking: next.booking.clone(),
                            from,
                            to,
                            occurred_at: now,
                        },
                    );
                    return Ok((WebhookDecision::Applied, None));
                }
            }
        }
        Err(StoreError::Conflict(format!("payment {payment_ref}")).into())
    }

    async fn cas_backoff(&self, attempt: u32) {
        let delay = self.settings.retry.delay_for_retry(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use waypost_billing::SubscriptionStatus;
    use waypost_core::{Currency, OrgId, SourceRef};
    use waypost_events::RecordingAuditSink;

    use crate::provider::ProviderError;
    use crate::provider::fake::ScriptedProvider;

    struct Fixture {
        bridge: BillingBridge,
        provider: Arc<ScriptedProvider>,
        usage: Arc<InMemoryUsageStore>,
        audit: Arc<RecordingAuditSink>,
    }

    fn fixture() -> Fixture {
        let usage = Arc::new(InMemoryUsageStore::new());
        let stores = BillingStores {
            usage: usage.clone(),
            ..BillingStores::in_memory()
        };
        let provider = Arc::new(ScriptedProvider::new());
        let audit = Arc::new(RecordingAuditSink::default());
        let settings = BridgeSettings {
            retry: RetryPolicy::fixed(2, std::time::Duration::from_millis(1)),
            ..Default::default()
        };
        Fixture {
            bridge: BillingBridge::new(stores, provider.clone(), audit.clone(), settings),
            provider,
            usage,
            audit,
        }
    }

    fn period() -> BillingPeriod {
        BillingPeriod::new(2026, 9).unwrap()
    }

    fn usage(tenant: TenantId, metric: &str, qty: u64, event: &str, offset_secs: i64) -> NewUsage {
        NewUsage::new(
            tenant,
            metric,
            qty,
            SourceRef::new("booking", event).unwrap(),
            event,
            period().start() + Duration::seconds(offset_secs),
        )
        .unwrap()
    }

    async fn tenant_with(f: &Fixture, mode: PushMode) -> TenantId {
        let tenant = TenantId::new();
        f.bridge
            .upsert_plan(
                &TenantPlan::new(tenant, "growth", mode, Currency::EUR)
                    .with_price("bookings", 100, dec!(0.50))
                    .with_price("searches", 1000, dec!(0.01)),
            )
            .await
            .unwrap();
        tenant
    }

    fn provider_event(id: &str, event_type: &str, object: serde_json::Value) -> ProviderEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "created": 1_790_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn usage_is_recorded_once_per_source_event() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Real).await;

        let first = f.bridge.track_usage(usage(tenant, "bookings", 3, "evt-1", 0)).await.unwrap();
        let again = f.bridge.track_usage(usage(tenant, "bookings", 3, "evt-1", 0)).await.unwrap();
        assert!(first.is_applied());
        assert!(again.is_already_applied());
        assert_eq!(f.usage.len(), 1);
    }

    #[tokio::test]
    async fn unmetered_tier_writes_nothing() {
        let f = fixture();
        let tenant = TenantId::new();
        f.bridge
            .upsert_plan(&TenantPlan::unmetered(tenant, "free", Currency::EUR))
            .await
            .unwrap();

        let out = f.bridge.track_usage(usage(tenant, "bookings", 1, "evt-1", 0)).await.unwrap();
        assert_eq!(out.rejection().unwrap().kind, RejectionKind::NotMetered);
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn shadow_mode_pushes_all_units_at_zero_price() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Shadow).await;
        f.bridge.track_usage(usage(tenant, "bookings", 150, "evt-1", 0)).await.unwrap();

        let report = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(report, PushReport { pushed: 1, skipped: 0, failed: 0 });

        let accepted = f.provider.accepted();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].quantity, 150);
        assert_eq!(accepted[0].unit_price, dec!(0));
    }

    #[tokio::test]
    async fn real_mode_pushes_only_the_overage() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Real).await;
        f.bridge.track_usage(usage(tenant, "bookings", 150, "evt-1", 0)).await.unwrap();

        f.bridge.push_unbilled(period()).await.unwrap();
        let accepted = f.provider.accepted();
        assert_eq!(accepted[0].quantity, 50);
        assert_eq!(accepted[0].unit_price, dec!(0.50));
    }

    #[tokio::test]
    async fn quota_carries_across_runs_and_nothing_is_pushed_twice() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Real).await;
        f.bridge.track_usage(usage(tenant, "bookings", 60, "evt-1", 0)).await.unwrap();

        let first = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(first, PushReport { pushed: 0, skipped: 1, failed: 0 });

        f.bridge.track_usage(usage(tenant, "bookings", 60, "evt-2", 10)).await.unwrap();
        let second = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(second, PushReport { pushed: 1, skipped: 0, failed: 0 });
        assert_eq!(f.provider.accepted()[0].quantity, 20);

        let third = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(third, PushReport::default());
        assert_eq!(f.provider.calls(), 1);
    }

    #[tokio::test]
    async fn failing_record_does_not_block_the_others() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Shadow).await;
        f.bridge.track_usage(usage(tenant, "bookings", 5, "evt-1", 0)).await.unwrap();
        f.bridge.track_usage(usage(tenant, "searches", 7, "evt-2", 0)).await.unwrap();
        f.provider
            .fail_next("bookings", ProviderError::Permanent("invalid customer".into()));

        let report = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(report, PushReport { pushed: 1, skipped: 0, failed: 1 });
        assert_eq!(f.audit.of_type("billing.usage.push_failed").len(), 1);

        // The failed record stays unbilled and goes out on the next run.
        let retry_run = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(retry_run, PushReport { pushed: 1, skipped: 0, failed: 0 });
    }

    #[tokio::test]
    async fn retried_record_pushes_the_share_it_was_first_planned() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Real).await;
        let early = f
            .bridge
            .track_usage(usage(tenant, "bookings", 120, "evt-1", 0))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        f.bridge.track_usage(usage(tenant, "bookings", 30, "evt-2", 10)).await.unwrap();
        f.provider
            .fail_next("bookings", ProviderError::Permanent("card declined".into()));

        let first = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(first, PushReport { pushed: 1, skipped: 0, failed: 1 });
        assert_eq!(f.usage.get(&early.key).unwrap().planned_quantity, Some(20));

        let second = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(second, PushReport { pushed: 1, skipped: 0, failed: 0 });

        let accepted = f.provider.accepted();
        let quantities: Vec<u64> = accepted.iter().map(|p| p.quantity).collect();
        assert_eq!(quantities, vec![30, 20]);
        assert_eq!(quantities.iter().sum::<u64>(), 50);
        assert_eq!(accepted[1].idempotency_key, early.key.provider_idempotency_key());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_with_the_same_idempotency_key() {
        let f = fixture();
        let tenant = tenant_with(&f, PushMode::Shadow).await;
        let tracked = f
            .bridge
            .track_usage(usage(tenant, "bookings", 2, "evt-1", 0))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        f.provider.fail_next("bookings", ProviderError::Transient("503".into()));
        f.provider.fail_next("bookings", ProviderError::Transient("timeout".into()));

        let report = f.bridge.push_unbilled(period()).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(f.provider.calls(), 3);
        assert_eq!(f.provider.accepted()[0].idempotency_key, tracked.key.provider_idempotency_key());

        let stored = f.usage.get(&tracked.key).unwrap();
        assert_eq!(stored.push_status, PushStatus::Pushed);
        assert!(stored.billed);
    }

    async fn subscription(f: &Fixture, status: SubscriptionStatus) -> BillingSubscription {
        let sub = BillingSubscription::new(TenantId::new(), "stripe", "sub_1", "growth", status, Utc::now()).unwrap();
        f.bridge.register_subscription(&sub).await.unwrap();
        sub
    }

    #[tokio::test]
    async fn subscription_events_apply_once_and_never_regress() {
        let f = fixture();
        subscription(&f, SubscriptionStatus::Trialing).await;

        let active = provider_event("evt_1", "customer.subscription.updated", json!({"id": "sub_1", "status": "active"}));
        assert_eq!(f.bridge.apply_provider_event("stripe", &active).await.unwrap(), WebhookDecision::Applied);
        assert_eq!(
            f.bridge.apply_provider_event("stripe", &active).await.unwrap(),
            WebhookDecision::IgnoredDuplicate
        );

        let canceled = provider_event("evt_2", "customer.subscription.deleted", json!({"id": "sub_1"}));
        assert_eq!(f.bridge.apply_provider_event("stripe", &canceled).await.unwrap(), WebhookDecision::Applied);

        // Late delivery of an older state.
        let late = provider_event("evt_3", "invoice.paid", json!({"subscription": "sub_1"}));
        assert_eq!(
            f.bridge.apply_provider_event("stripe", &late).await.unwrap(),
            WebhookDecision::IgnoredOutOfOrder
        );

        let stored = f.bridge.stores().subscriptions.by_provider_id("stripe", "sub_1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert_eq!(f.audit.of_type("billing.subscription.transitioned").len(), 2);

        let record = f.bridge.stores().webhooks.get("stripe", "evt_3").await.unwrap().unwrap();
        assert_eq!(record.decision, Some(WebhookDecision::IgnoredOutOfOrder));
    }

    #[tokio::test]
    async fn past_due_opens_a_grace_window() {
        let f = fixture();
        subscription(&f, SubscriptionStatus::Active).await;

        let failed = provider_event("evt_1", "invoice.payment_failed", json!({"subscription": "sub_1"}));
        f.bridge.apply_provider_event("stripe", &failed).await.unwrap();

        let stored = f.bridge.stores().subscriptions.by_provider_id("stripe", "sub_1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        let until = stored.grace_period_until.unwrap();
        assert!(until > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn unknown_target_is_an_error_and_reprocessed_on_redelivery() {
        let f = fixture();
        let paid = provider_event("evt_9", "payment_intent.succeeded", json!({"id": "pi_1"}));
        assert_eq!(f.bridge.apply_provider_event("stripe", &paid).await.unwrap(), WebhookDecision::Error);

        let payment = BookingPayment::new(OrgId::new(), SourceRef::new("booking", "BK-1").unwrap(), "pi_1", Utc::now()).unwrap();
        f.bridge.register_payment(&payment).await.unwrap();

        assert_eq!(f.bridge.apply_provider_event("stripe", &paid).await.unwrap(), WebhookDecision::Applied);
        let stored = f.bridge.stores().payments.by_provider_ref("pi_1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
    }

    /// Loses the first `losses` compare-and-set races.
    struct ContendedPayments {
        inner: InMemoryPaymentStore,
        losses: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl PaymentStore for ContendedPayments {
        async fn insert(&self, payment: &BookingPayment) -> Result<crate::store::Inserted<BookingPayment>, StoreError> {
            self.inner.insert(payment).await
        }

        async fn by_provider_ref(&self, payment_ref: &str) -> Result<Option<BookingPayment>, StoreError> {
            self.inner.by_provider_ref(payment_ref).await
        }

        async fn compare_and_set(&self, payment: &BookingPayment, expected: PaymentStatus) -> Result<bool, StoreError> {
            use std::sync::atomic::Ordering;
            let lost = self
                .losses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Ok(false);
            }
            self.inner.compare_and_set(payment, expected).await
        }
    }

    fn contended_bridge(losses: u32) -> BillingBridge {
        let stores = BillingStores {
            payments: Arc::new(ContendedPayments {
                inner: InMemoryPaymentStore::new(),
                losses: std::sync::atomic::AtomicU32::new(losses),
            }),
            ..BillingStores::in_memory()
        };
        let settings = BridgeSettings {
            retry: RetryPolicy::fixed(2, std::time::Duration::from_millis(25)),
            ..Default::default()
        };
        BillingBridge::new(
            stores,
            Arc::new(ScriptedProvider::new()),
            Arc::new(RecordingAuditSink::default()),
            settings,
        )
    }

    #[tokio::test]
    async fn lost_payment_races_back_off_before_retrying() {
        let bridge = contended_bridge(2);
        let payment = BookingPayment::new(OrgId::new(), SourceRef::new("booking", "BK-3").unwrap(), "pi_3", Utc::now()).unwrap();
        bridge.register_payment(&payment).await.unwrap();

        let started = std::time::Instant::now();
        let paid = provider_event("evt_1", "payment_intent.succeeded", json!({"id": "pi_3"}));
        assert_eq!(bridge.apply_provider_event("stripe", &paid).await.unwrap(), WebhookDecision::Applied);
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));

        let stored = bridge.stores().payments.by_provider_ref("pi_3").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn exhausted_payment_races_end_in_error() {
        let bridge = contended_bridge(CAS_ATTEMPTS);
        let payment = BookingPayment::new(OrgId::new(), SourceRef::new("booking", "BK-4").unwrap(), "pi_4", Utc::now()).unwrap();
        bridge.register_payment(&payment).await.unwrap();

        let paid = provider_event("evt_1", "payment_intent.succeeded", json!({"id": "pi_4"}));
        assert_eq!(bridge.apply_provider_event("stripe", &paid).await.unwrap(), WebhookDecision::Error);
        let stored = bridge.stores().payments.by_provider_ref("pi_4").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Unset);
    }

    #[tokio::test]
    async fn final_payment_state_is_not_regressed() {
        let f = fixture();
        let payment = BookingPayment::new(OrgId::new(), SourceRef::new("booking", "BK-2").unwrap(), "pi_2", Utc::now()).unwrap();
        f.bridge.register_payment(&payment).await.unwrap();

        let paid = provider_event("evt_1", "payment_intent.succeeded", json!({"id": "pi_2"}));
        let failed = provider_event("evt_2", "payment_intent.payment_failed", json!({"id": "pi_2"}));
        let processing = provider_event("evt_3", "payment_intent.processing", json!({"id": "pi_2"}));

        assert_eq!(f.bridge.apply_provider_event("stripe", &paid).await.unwrap(), WebhookDecision::Applied);
        assert_eq!(
            f.bridge.apply_provider_event("stripe", &failed).await.unwrap(),
            WebhookDecision::IgnoredOutOfOrder
        );
        assert_eq!(
            f.bridge.apply_provider_event("stripe", &processing).await.unwrap(),
            WebhookDecision::IgnoredNotFinal
        );
    }

    #[tokio::test]
    async fn malformed_event_is_recorded_as_error() {
        let f = fixture();
        let bad = provider_event("evt_1", "customer.subscription.updated", json!({"status": "active"}));
        assert_eq!(f.bridge.apply_provider_event("stripe", &bad).await.unwrap(), WebhookDecision::Error);
        let record = f.bridge.stores().webhooks.get("stripe", "evt_1").await.unwrap().unwrap();
        assert!(record.detail.unwrap().contains("data.object.id"));
    }
}
