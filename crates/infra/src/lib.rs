//! Infrastructure layer: stores, engine services, the finalize scheduler and config.

pub mod billing_bridge;
pub mod config;
pub mod credit_guard;
pub mod error;
pub mod fx_service;
pub mod posting_engine;
pub mod postgres;
pub mod provider;
pub mod refund_workflow;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use billing_bridge::{BillingBridge, BillingStores, BridgeSettings, PushReport};
pub use config::{BillingConfig, EngineConfig, LedgerConfig, SchedulerConfig};
pub use credit_guard::{
    AgencyLockGuard, AgencyLocks, CreditGuard, InMemoryAgencyLocks, Reservation, ReservationOutcome,
};
pub use error::EngineError;
pub use fx_service::FxSnapshotService;
pub use posting_engine::PostingEngine;
pub use provider::{BillingProvider, LoggingProvider, ProviderError, UsagePush};
pub use refund_workflow::{PayoutAccounts, REFUND_PAID, RefundWorkflow};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{
    FinalizeRun, JobContext, JobError, JobHandler, JobRegistry, JobReport, MonthlyFinalizeHandler, MonthlySchedule,
    ScheduledJob, Scheduler, SchedulerHandle,
};
pub use store::{Inserted, StoreError};
