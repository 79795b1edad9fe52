//! Usage metering and billing-provider reconciliation domain.
//!
//! Pure rules only: usage records and their provider idempotency keys, the
//! shadow/real overage split, period arithmetic, subscription and booking
//! payment compare-and-swap transitions, and provider event interpretation.

pub mod cas;
pub mod error;
pub mod event;
pub mod finalize;
pub mod overage;
pub mod payment;
pub mod period;
pub mod plan;
pub mod subscription;
pub mod usage;
pub mod webhook;

pub use cas::CasOutcome;
pub use error::BillingError;
pub use event::BillingEvent;
pub use finalize::{FinalizeStatus, FinalizeSummary, PeriodClaim, PeriodFinalizeRecord};
pub use overage::{PushPlan, plan_pushes, pushed_quantity};
pub use payment::{BookingPayment, PaymentStatus};
pub use period::BillingPeriod;
pub use plan::{MetricPrice, PushMode, TenantPlan};
pub use subscription::{BillingSubscription, SubscriptionStatus, SubscriptionUpdate};
pub use usage::{NewUsage, PushStatus, UsageKey, UsageLedgerRecord};
pub use webhook::{
    ProviderAction, ProviderEvent, ProviderEventData, WebhookDecision, WebhookEventRecord, interpret,
};
