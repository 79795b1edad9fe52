use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use waypost_billing::{
    BillingEvent, BillingPeriod, FinalizeStatus, FinalizeSummary, PeriodClaim, PeriodFinalizeRecord,
};
use waypost_core::{Outcome, RejectionKind};
use waypost_events::{emit, AuditScope, AuditSink};

use super::job::{JobContext, JobError, JobHandler, JobReport};
use crate::billing_bridge::BillingBridge;
use crate::error::EngineError;
use crate::store::FinalizeStore;

/// Result of one attempt at finalizing a period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeRun {
    Completed(PeriodFinalizeRecord),
    /// The period already finalized successfully; nothing was pushed.
    AlreadyDone(PeriodFinalizeRecord),
    LockFailed { owner: String, lease_until: DateTime<Utc> },
}

/// Pushes every unbilled usage record of the last closed period, under the
/// period lock.
pub struct MonthlyFinalizeHandler {
    bridge: Arc<BillingBridge>,
    store: Arc<dyn FinalizeStore>,
    audit: Arc<dyn AuditSink>,
    lease: Duration,
}

impl MonthlyFinalizeHandler {
    pub const NAME: &'static str = "monthly_finalize";

    pub fn new(
        bridge: Arc<BillingBridge>,
        store: Arc<dyn FinalizeStore>,
        audit: Arc<dyn AuditSink>,
        lease: Duration,
    ) -> Self {
        Self {
            bridge,
            store,
            audit,
            lease,
        }
    }

    #[instrument(skip(self, now), fields(period = %period), err)]
    pub async fn finalize(
        &self,
        period: BillingPeriod,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<FinalizeRun, EngineError> {
        let mut record = match self.store.claim(period, owner, now, self.lease).await? {
            PeriodClaim::Claimed(record) => record,
            PeriodClaim::AlreadySucceeded(record) => {
                info!("period already finalized");
                return Ok(FinalizeRun::AlreadyDone(record));
            }
            PeriodClaim::Locked { owner, lease_until } => {
                warn!(holder = %owner, %lease_until, "period lock held by another worker");
                return Ok(FinalizeRun::LockFailed { owner, lease_until });
            }
        };

        let (summary, error) = match self.bridge.push_unbilled(period).await {
            Ok(report) => (FinalizeSummary::from(report), None),
            Err(e) => {
                warn!(error = %e, "finalize run aborted");
                (FinalizeSummary::default(), Some(e.to_string()))
            }
        };
        record.complete(summary, error, now);
        self.store.complete(&record).await?;

        emit(
            self.audit.as_ref(),
            AuditScope::System,
            period.label(),
            &BillingEvent::PeriodFinalized {
                period,
                pushed: summary.pushed,
                skipped: summary.skipped,
                failed: summary.failed,
                occurred_at: record.updated_at,
            },
        );
        info!(
            status = record.status.as_str(),
            pushed = summary.pushed,
            skipped = summary.skipped,
            failed = summary.failed,
            attempts = record.attempts,
            "period finalize completed"
        );
        Ok(FinalizeRun::Completed(record))
    }
}

#[async_trait]
impl JobHandler for MonthlyFinalizeHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Finalizes the period closed by `ctx.due`, after catching up earlier
    /// periods whose last run failed, ended partial or was interrupted.
    async fn run(&self, ctx: &JobContext) -> Result<Outcome<JobReport>, JobError> {
        let period = BillingPeriod::last_closed(ctx.due).map_err(EngineError::from)?;
        let mut notes = Vec::new();
        let mut incomplete = false;

        for earlier in self.store.unfinished(period).await.map_err(EngineError::from)? {
            let earlier = earlier.period;
            info!(period = %earlier, "catching up unfinished period");
            match self.finalize(earlier, &ctx.owner, ctx.started_at).await? {
                FinalizeRun::Completed(rec) => {
                    incomplete |= rec.status != FinalizeStatus::Success;
                    notes.push(format!("{earlier}: {}", rec.status.as_str()));
                }
                FinalizeRun::AlreadyDone(_) => {}
                FinalizeRun::LockFailed { owner, .. } => {
                    incomplete = true;
                    notes.push(format!("{earlier}: locked by {owner}"));
                }
            }
        }

        let outcome = match self.finalize(period, &ctx.owner, ctx.started_at).await? {
            FinalizeRun::Completed(rec) => {
                incomplete |= rec.status != FinalizeStatus::Success;
                notes.push(format!(
                    "{period}: {} (pushed {}, skipped {}, failed {})",
                    rec.status.as_str(),
                    rec.summary.pushed,
                    rec.summary.skipped,
                    rec.summary.failed
                ));
                Outcome::Applied(report(notes, incomplete))
            }
            FinalizeRun::AlreadyDone(_) => {
                let caught_up = !notes.is_empty();
                notes.push(format!("{period}: already finalized"));
                if caught_up {
                    Outcome::Applied(report(notes, incomplete))
                } else {
                    Outcome::AlreadyApplied(report(notes, incomplete))
                }
            }
            FinalizeRun::LockFailed { owner, lease_until } => Outcome::rejected(
                RejectionKind::LockHeld,
                format!("{period} locked by {owner} until {lease_until}"),
            ),
        };
        Ok(outcome)
    }
}

fn report(notes: Vec<String>, incomplete: bool) -> JobReport {
    JobReport {
        detail: notes.join("; "),
        incomplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use waypost_billing::{NewUsage, PushMode, TenantPlan};
    use waypost_core::{Currency, SourceRef, TenantId};
    use waypost_events::RecordingAuditSink;

    use crate::billing_bridge::{BillingStores, BridgeSettings};
    use crate::provider::fake::ScriptedProvider;
    use crate::provider::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::scheduler::{JobRegistry, MonthlySchedule, ScheduledJob, Scheduler};
    use crate::store::InMemoryFinalizeStore;

    struct Fixture {
        handler: Arc<MonthlyFinalizeHandler>,
        bridge: Arc<BillingBridge>,
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryFinalizeStore>,
        audit: Arc<RecordingAuditSink>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(ScriptedProvider::new());
        let audit = Arc::new(RecordingAuditSink::default());
        let settings = BridgeSettings {
            retry: RetryPolicy::no_retry(),
            ..Default::default()
        };
        let bridge = Arc::new(BillingBridge::new(
            BillingStores::in_memory(),
            provider.clone(),
            audit.clone(),
            settings,
        ));
        let store = Arc::new(InMemoryFinalizeStore::new());
        Fixture {
            handler: Arc::new(MonthlyFinalizeHandler::new(
                bridge.clone(),
                store.clone(),
                audit.clone(),
                Duration::minutes(30),
            )),
            bridge,
            provider,
            store,
            audit,
        }
    }

    fn period() -> BillingPeriod {
        BillingPeriod::new(2026, 9).unwrap()
    }

    async fn seed(f: &Fixture, metric: &str, events: &[&str]) {
        let tenant = TenantId::new();
        f.bridge
            .upsert_plan(&TenantPlan::new(tenant, "growth", PushMode::Real, Currency::EUR).with_price(metric, 0, dec!(1)))
            .await
            .unwrap();
        for (i, event) in events.iter().enumerate() {
            let usage = NewUsage::new(
                tenant,
                metric,
                1,
                SourceRef::new("booking", *event).unwrap(),
                *event,
                period().start() + Duration::hours(i as i64 + 1),
            )
            .unwrap();
            f.bridge.track_usage(usage).await.unwrap();
        }
    }

    fn after_close() -> DateTime<Utc> {
        period().end() + Duration::hours(2)
    }

    #[tokio::test]
    async fn successful_period_is_not_finalized_twice() {
        let f = fixture();
        seed(&f, "bookings", &["b1", "b2"]).await;

        let first = f.handler.finalize(period(), "w1", after_close()).await.unwrap();
        match first {
            FinalizeRun::Completed(rec) => {
                assert_eq!(rec.status, FinalizeStatus::Success);
                assert_eq!(rec.summary.pushed, 2);
            }
            other => panic!("unexpected run: {other:?}"),
        }
        let calls = f.provider.calls();

        let second = f.handler.finalize(period(), "w2", after_close()).await.unwrap();
        assert!(matches!(second, FinalizeRun::AlreadyDone(_)));
        assert_eq!(f.provider.calls(), calls);
        assert_eq!(f.audit.of_type("billing.period.finalized").len(), 1);
    }

    #[tokio::test]
    async fn live_lease_of_another_worker_fails_the_lock() {
        let f = fixture();
        let now = after_close();
        f.store.claim(period(), "other", now, Duration::minutes(30)).await.unwrap();

        let run = f.handler.finalize(period(), "w1", now + Duration::minutes(5)).await.unwrap();
        assert!(matches!(run, FinalizeRun::LockFailed { ref owner, .. } if owner == "other"));
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn partial_run_can_be_retried() {
        let f = fixture();
        seed(&f, "bookings", &["b1"]).await;
        seed(&f, "searches", &["s1"]).await;
        f.provider
            .fail_next("searches", ProviderError::Permanent("rejected".into()));

        let run = f.handler.finalize(period(), "w1", after_close()).await.unwrap();
        let FinalizeRun::Completed(rec) = run else {
            panic!("expected a completed run");
        };
        assert_eq!(rec.status, FinalizeStatus::Partial);
        assert_eq!(rec.summary.failed, 1);

        let retry = f.handler.finalize(period(), "w1", after_close() + Duration::minutes(1)).await.unwrap();
        let FinalizeRun::Completed(rec) = retry else {
            panic!("expected a completed retry");
        };
        assert_eq!(rec.status, FinalizeStatus::Success);
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.summary.pushed, 1);
    }

    fn scheduler(f: &Fixture) -> Scheduler {
        let registry = JobRegistry::builder().register(f.handler.clone()).unwrap().build();
        let job = ScheduledJob {
            name: MonthlyFinalizeHandler::NAME.into(),
            schedule: MonthlySchedule::new(1, 2, 0).unwrap(),
            enabled: true,
            misfire_grace: Duration::hours(1),
            retry_interval: Duration::minutes(15),
        };
        Scheduler::new(registry, vec![job], "w1", std::time::Duration::from_secs(30))
    }

    fn october(h: u32, m: u32) -> DateTime<Utc> {
        period().end() + Duration::hours(h as i64) + Duration::minutes(m as i64)
    }

    #[tokio::test]
    async fn scheduler_retries_a_partial_period_within_the_month() {
        let f = fixture();
        seed(&f, "bookings", &["b1"]).await;
        seed(&f, "searches", &["s1"]).await;
        f.provider
            .fail_next("searches", ProviderError::Permanent("rejected".into()));
        let s = scheduler(&f);

        let runs = s.tick(october(2, 5)).await;
        let report = runs[0].result.as_ref().unwrap().value().unwrap();
        assert!(report.incomplete);
        assert_eq!(f.store.get(period()).await.unwrap().unwrap().status, FinalizeStatus::Partial);
        assert!(s.tick(october(2, 10)).await.is_empty());

        let runs = s.tick(october(2, 30)).await;
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].result.as_ref().unwrap().value().unwrap().incomplete);
        let rec = f.store.get(period()).await.unwrap().unwrap();
        assert_eq!(rec.status, FinalizeStatus::Success);
        assert_eq!(rec.attempts, 2);
        assert_eq!(f.provider.accepted().len(), 2);

        assert!(s.tick(october(3, 0)).await.is_empty());
        assert_eq!(s.status()[MonthlyFinalizeHandler::NAME].retry_due, None);
    }

    #[tokio::test]
    async fn next_month_catches_up_an_unfinished_period() {
        let f = fixture();
        seed(&f, "bookings", &["b1"]).await;
        f.provider
            .fail_next("bookings", ProviderError::Permanent("rejected".into()));
        let run = f.handler.finalize(period(), "w1", october(2, 0)).await.unwrap();
        assert!(matches!(run, FinalizeRun::Completed(ref rec) if rec.status == FinalizeStatus::Failed));

        let s = scheduler(&f);
        let october_period = BillingPeriod::new(2026, 10).unwrap();
        let november = october_period.end() + Duration::hours(2);
        let runs = s.tick(november).await;
        let outcome = runs[0].result.as_ref().unwrap();
        assert!(outcome.is_applied());
        assert!(outcome.value().unwrap().detail.starts_with("2026-09: success"));

        assert_eq!(f.store.get(period()).await.unwrap().unwrap().status, FinalizeStatus::Success);
        let october_rec = f.store.get(october_period).await.unwrap().unwrap();
        assert_eq!(october_rec.status, FinalizeStatus::Success);
        assert_eq!(f.provider.accepted().len(), 1);
    }

    #[tokio::test]
    async fn job_maps_a_held_lock_to_a_rejection() {
        let f = fixture();
        let due = period().end() + Duration::hours(2);
        f.store.claim(period(), "other", due, Duration::minutes(30)).await.unwrap();

        let ctx = JobContext {
            due,
            started_at: due,
            owner: "w1".into(),
        };
        let outcome = f.handler.run(&ctx).await.unwrap();
        assert_eq!(outcome.rejection().map(|r| r.kind), Some(RejectionKind::LockHeld));
    }
}
