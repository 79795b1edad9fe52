use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::{SourceRef, SubscriptionId, UsageRecordId};
use waypost_events::Event;

use crate::payment::PaymentStatus;
use crate::period::BillingPeriod;
use crate::plan::PushMode;
use crate::subscription::SubscriptionStatus;
use crate::webhook::WebhookDecision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingEvent {
    UsagePushed {
        record_id: UsageRecordId,
        metric: String,
        quantity: u64,
        mode: PushMode,
        provider_ref: String,
        occurred_at: DateTime<Utc>,
    },
    UsagePushFailed {
        record_id: UsageRecordId,
        metric: String,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    SubscriptionTransitioned {
        subscription_id: SubscriptionId,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        cancel_at_period_end: bool,
        occurred_at: DateTime<Utc>,
    },
    PaymentStatusChanged {
        booking: SourceRef,
        from: PaymentStatus,
        to: PaymentStatus,
        occurred_at: DateTime<Utc>,
    },
    WebhookDecided {
        provider: String,
        event_id: String,
        event_type: String,
        decision: WebhookDecision,
        occurred_at: DateTime<Utc>,
    },
    PeriodFinalized {
        period: BillingPeriod,
        pushed: u32,
        skipped: u32,
        failed: u32,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for BillingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::UsagePushed { .. } => "billing.usage.pushed",
            BillingEvent::UsagePushFailed { .. } => "billing.usage.push_failed",
            BillingEvent::SubscriptionTransitioned { .. } => "billing.subscription.transitioned",
            BillingEvent::PaymentStatusChanged { .. } => "billing.payment.status_changed",
            BillingEvent::WebhookDecided { .. } => "billing.webhook.decided",
            BillingEvent::PeriodFinalized { .. } => "billing.period.finalized",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BillingEvent::UsagePushed { occurred_at, .. }
            | BillingEvent::UsagePushFailed { occurred_at, .. }
            | BillingEvent::SubscriptionTransitioned { occurred_at, .. }
            | BillingEvent::PaymentStatusChanged { occurred_at, .. }
            | BillingEvent::WebhookDecided { occurred_at, .. }
            | BillingEvent::PeriodFinalized { occurred_at, .. } => *occurred_at,
        }
    }
}
