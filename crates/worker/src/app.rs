//! Runtime wiring: stores, services and the scheduler, in-memory or on Postgres.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{info, warn};

use waypost_events::{AuditSink, BusAuditSink, EventBus, EventEnvelope, InMemoryEventBus, TracingAuditSink};
use waypost_infra::postgres::{
    self, PgAgencyLocks, PostgresCreditProfileStore, PostgresFinalizeStore, PostgresFxStore, PostgresLedgerStore,
};
use waypost_infra::store::{
    CreditProfileStore, FinalizeStore, FxStore, InMemoryCreditProfileStore, InMemoryFinalizeStore, InMemoryFxStore,
    InMemoryLedgerStore, LedgerStore,
};
use waypost_infra::{
    AgencyLocks, BillingBridge, BillingProvider, BillingStores, CreditGuard, EngineConfig, FxSnapshotService,
    InMemoryAgencyLocks, JobRegistry, MonthlyFinalizeHandler, PostingEngine, RefundWorkflow, Scheduler,
};

const POOL_SIZE: u32 = 10;

/// Where the engine keeps its state.
#[derive(Debug, Clone)]
pub enum Storage {
    InMemory,
    Postgres(PgPool),
}

impl Storage {
    pub fn label(&self) -> &'static str {
        match self {
            Storage::InMemory => "in_memory",
            Storage::Postgres(_) => "postgres",
        }
    }
}

/// Every engine service, sharing one set of stores and one audit sink.
pub struct Engine {
    pub config: EngineConfig,
    pub storage: Storage,
    pub audit: Arc<dyn AuditSink>,
    pub ledger: PostingEngine,
    pub fx: FxSnapshotService,
    pub credit: CreditGuard,
    pub refunds: RefundWorkflow,
    pub billing: Arc<BillingBridge>,
    pub finalize: Arc<MonthlyFinalizeHandler>,
}

struct Stores {
    ledger: Arc<dyn LedgerStore>,
    fx: Arc<dyn FxStore>,
    credit: Arc<dyn CreditProfileStore>,
    locks: Arc<dyn AgencyLocks>,
    finalize: Arc<dyn FinalizeStore>,
    billing: BillingStores,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryLedgerStore::new()),
            fx: Arc::new(InMemoryFxStore::new()),
            credit: Arc::new(InMemoryCreditProfileStore::new()),
            locks: Arc::new(InMemoryAgencyLocks::new()),
            finalize: Arc::new(InMemoryFinalizeStore::new()),
            billing: BillingStores::in_memory(),
        }
    }

    fn postgres(pool: &PgPool) -> Self {
        Self {
            ledger: Arc::new(PostgresLedgerStore::new(pool.clone())),
            fx: Arc::new(PostgresFxStore::new(pool.clone())),
            credit: Arc::new(PostgresCreditProfileStore::new(pool.clone())),
            locks: Arc::new(PgAgencyLocks::new(pool.clone())),
            finalize: Arc::new(PostgresFinalizeStore::new(pool.clone())),
            billing: BillingStores::postgres(pool),
        }
    }
}

/// Build the services. `DATABASE_URL` in `config` selects Postgres (schema
/// created on first start); otherwise everything lives in memory.
pub async fn build_engine(
    config: EngineConfig,
    provider: Arc<dyn BillingProvider>,
    audit: Arc<dyn AuditSink>,
) -> anyhow::Result<Engine> {
    let (storage, stores) = match &config.database_url {
        Some(url) => {
            let pool = postgres::connect(url, POOL_SIZE)
                .await
                .context("failed to connect to Postgres")?;
            postgres::migrate(&pool).await.context("failed to apply schema")?;
            let stores = Stores::postgres(&pool);
            (Storage::Postgres(pool), stores)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            (Storage::InMemory, Stores::in_memory())
        }
    };

    let ledger = PostingEngine::new(stores.ledger, audit.clone())
        .with_tolerance(config.ledger.balance_tolerance)
        .with_amendment_tolerance(config.ledger.amendment_tolerance);
    let fx = FxSnapshotService::new(stores.fx, audit.clone());
    let credit = CreditGuard::new(stores.credit, ledger.clone(), stores.locks, audit.clone());
    let refunds = RefundWorkflow::new(ledger.clone(), audit.clone());
    let billing = Arc::new(BillingBridge::new(
        stores.billing,
        provider,
        audit.clone(),
        config.bridge_settings(),
    ));
    let finalize = Arc::new(MonthlyFinalizeHandler::new(
        billing.clone(),
        stores.finalize,
        audit.clone(),
        config.finalize_lease(),
    ));

    info!(storage = storage.label(), provider = %config.billing.provider_name, "engine ready");
    Ok(Engine {
        config,
        storage,
        audit,
        ledger,
        fx,
        credit,
        refunds,
        billing,
        finalize,
    })
}

/// Scheduler with the monthly finalize job registered.
pub fn build_scheduler(engine: &Engine) -> anyhow::Result<Scheduler> {
    let registry = JobRegistry::builder()
        .register(engine.finalize.clone())
        .context("failed to register finalize job")?
        .build();
    Ok(Scheduler::new(
        registry,
        vec![engine.config.finalize_job()],
        engine.config.scheduler.owner.clone(),
        engine.config.tick_interval(),
    ))
}

type AuditBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

/// Audit sink publishing to an in-process bus, plus the consumer thread that
/// writes every record to the `audit` tracing target. The thread exits once
/// the sink (and with it the bus) is dropped.
pub fn audit_pipeline() -> (Arc<dyn AuditSink>, thread::JoinHandle<()>) {
    let bus: Arc<AuditBus> = Arc::new(InMemoryEventBus::new());
    let subscription = bus.subscribe();
    let consumer = thread::spawn(move || {
        let sink = TracingAuditSink;
        while let Ok(envelope) = subscription.recv() {
            sink.record(envelope);
        }
    });
    (Arc::new(BusAuditSink::new(bus)), consumer)
}
