//! Drives the wired engine end to end on in-memory stores.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal_macros::dec;

use waypost_billing::{BillingPeriod, FinalizeStatus, NewUsage, PushMode, TenantPlan};
use waypost_core::{AccountId, AgencyId, Amount, ContextRef, Currency, OrgId, SourceRef, TenantId};
use waypost_credit::CreditProfile;
use waypost_events::RecordingAuditSink;
use waypost_fx::FxRate;
use waypost_infra::{EngineConfig, FinalizeRun, LoggingProvider, Reservation};
use waypost_ledger::{AccountType, OpenAccount};
use waypost_worker::{Engine, build_engine, build_scheduler};

async fn engine() -> (Engine, Arc<RecordingAuditSink>) {
    let audit = Arc::new(RecordingAuditSink::default());
    let engine = build_engine(EngineConfig::default(), Arc::new(LoggingProvider::new("test")), audit.clone())
        .await
        .unwrap();
    (engine, audit)
}

async fn open(engine: &Engine, org: OrgId, account_type: AccountType, code: &str, owner: Option<uuid::Uuid>) -> AccountId {
    engine
        .ledger
        .open_account(OpenAccount {
            org_id: org,
            account_type,
            code: code.into(),
            currency: Currency::EUR,
            owner_id: owner,
        })
        .await
        .unwrap()
        .into_value()
        .unwrap()
        .id
}

fn september() -> BillingPeriod {
    BillingPeriod::new(2026, 9).unwrap()
}

fn after_close() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 3, 0, 0).unwrap()
}

async fn seed_usage(engine: &Engine, events: &[&str]) -> TenantId {
    let tenant = TenantId::new();
    engine
        .billing
        .upsert_plan(&TenantPlan::new(tenant, "growth", PushMode::Real, Currency::EUR).with_price("bookings", 0, dec!(2)))
        .await
        .unwrap();
    for (i, event) in events.iter().enumerate() {
        let usage = NewUsage::new(
            tenant,
            "bookings",
            1,
            SourceRef::new("booking", *event).unwrap(),
            *event,
            september().start() + Duration::hours(i as i64 + 1),
        )
        .unwrap();
        engine.billing.track_usage(usage).await.unwrap();
    }
    tenant
}

#[tokio::test]
async fn credit_reservation_is_applied_once() {
    let (engine, audit) = engine().await;
    let org = OrgId::new();
    let agency = AgencyId::new();
    open(&engine, org, AccountType::Agency, "AG-1", Some(*agency.as_uuid())).await;
    let clearing = open(&engine, org, AccountType::Clearing, "CLR", None).await;
    engine
        .credit
        .upsert_profile(&CreditProfile::new(org, agency, dec!(1000), dec!(800), Currency::EUR, 30, Utc::now()).unwrap())
        .await
        .unwrap();

    let reservation = Reservation {
        source: SourceRef::new("booking", "BK-100").unwrap(),
        event: "CREDIT_RESERVED".into(),
        counter_account: clearing,
        occurred_at: Utc::now(),
    };
    let amount = Amount::new(dec!(250)).unwrap();

    let first = engine
        .credit
        .check_and_reserve(org, agency, amount, Currency::EUR, &reservation)
        .await
        .unwrap();
    assert!(first.is_applied());
    assert_eq!(first.label(), "applied");

    let replay = engine
        .credit
        .check_and_reserve(org, agency, amount, Currency::EUR, &reservation)
        .await
        .unwrap();
    assert!(replay.is_already_applied());
    assert_eq!(replay.label(), "ignored_duplicate");

    assert_eq!(engine.credit.exposure(org, agency, Currency::EUR).await.unwrap(), dec!(250));
    assert_eq!(audit.of_type("credit.reserved").len(), 1);
}

#[tokio::test]
async fn fx_snapshot_is_frozen_per_context() {
    let (engine, _audit) = engine().await;
    let org = OrgId::new();
    let as_of = Utc::now() - Duration::minutes(5);
    engine
        .fx
        .record_rate(&FxRate::new(org, Currency::EUR, Currency::TRY, dec!(35.10), as_of, "ecb").unwrap())
        .await
        .unwrap();

    let context = ContextRef::new("booking", "BK-7").unwrap();
    let first = engine
        .fx
        .snapshot_for_context(org, context.clone(), Currency::EUR, Currency::TRY)
        .await
        .unwrap()
        .into_value()
        .unwrap();

    engine
        .fx
        .record_rate(&FxRate::new(org, Currency::EUR, Currency::TRY, dec!(36.40), Utc::now(), "ecb").unwrap())
        .await
        .unwrap();
    let again = engine
        .fx
        .snapshot_for_context(org, context, Currency::EUR, Currency::TRY)
        .await
        .unwrap();

    assert!(again.is_already_applied());
    let again = again.into_value().unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.rate, dec!(35.10));
}

#[tokio::test]
async fn finalize_pushes_usage_once_per_period() {
    let (engine, audit) = engine().await;
    seed_usage(&engine, &["BK-1", "BK-2", "BK-3"]).await;

    let run = engine.finalize.finalize(september(), "worker-a", after_close()).await.unwrap();
    let FinalizeRun::Completed(record) = run else {
        panic!("expected a completed run, got {run:?}");
    };
    assert_eq!(record.status, FinalizeStatus::Success);
    assert_eq!(record.summary.pushed, 3);

    let rerun = engine
        .finalize
        .finalize(september(), "worker-b", after_close() + Duration::hours(1))
        .await
        .unwrap();
    assert!(matches!(rerun, FinalizeRun::AlreadyDone(_)));
    assert_eq!(audit.of_type("billing.period.finalized").len(), 1);
}

#[tokio::test]
async fn scheduler_finalizes_the_closed_month() {
    let (engine, audit) = engine().await;
    seed_usage(&engine, &["BK-9"]).await;
    let scheduler = build_scheduler(&engine).unwrap();

    let runs = scheduler.tick(after_close()).await;
    assert_eq!(runs.len(), 1);
    let outcome = runs[0].result.as_ref().unwrap();
    assert!(outcome.is_applied());

    // Same due time: coalesced.
    assert!(scheduler.tick(after_close() + Duration::minutes(1)).await.is_empty());
    assert_eq!(audit.of_type("billing.period.finalized").len(), 1);
}
