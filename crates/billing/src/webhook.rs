//! Provider webhook events: dedupe records and interpretation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use waypost_core::DomainError;

use crate::error::BillingError;
use crate::payment::PaymentStatus;
use crate::subscription::{SubscriptionStatus, SubscriptionUpdate};

/// Generic provider event, signature already verified upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds.
    #[serde(default)]
    pub created: i64,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEventData {
    pub object: JsonValue,
}

impl ProviderEvent {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created, 0).single()
    }
}

/// Persisted decision for one provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDecision {
    Applied,
    IgnoredDuplicate,
    IgnoredOutOfOrder,
    IgnoredNotFinal,
    Error,
}

impl WebhookDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookDecision::Applied => "applied",
            WebhookDecision::IgnoredDuplicate => "ignored_duplicate",
            WebhookDecision::IgnoredOutOfOrder => "ignored_out_of_order",
            WebhookDecision::IgnoredNotFinal => "ignored_not_final",
            WebhookDecision::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "applied" => Ok(WebhookDecision::Applied),
            "ignored_duplicate" => Ok(WebhookDecision::IgnoredDuplicate),
            "ignored_out_of_order" => Ok(WebhookDecision::IgnoredOutOfOrder),
            "ignored_not_final" => Ok(WebhookDecision::IgnoredNotFinal),
            "error" => Ok(WebhookDecision::Error),
            other => Err(DomainError::validation(format!("unknown webhook decision '{other}'"))),
        }
    }
}

/// Idempotency record, unique on `(provider, event_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    /// `None` while the claiming delivery is still processing.
    pub decision: Option<WebhookDecision>,
    pub detail: Option<String>,
    pub deliveries: u32,
    pub claimed_at: DateTime<Utc>,
}

impl WebhookEventRecord {
    pub fn claim(provider: &str, event: &ProviderEvent, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            received_at: now,
            decision: None,
            detail: None,
            deliveries: 1,
            claimed_at: now,
        }
    }

    /// A redelivery may process the event again when the earlier attempt
    /// failed, or when it never recorded a decision within `stale_after`.
    pub fn reclaimable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.decision {
            Some(WebhookDecision::Error) => true,
            Some(_) => false,
            None => now - self.claimed_at > stale_after,
        }
    }
}

/// What a provider event asks this engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAction {
    Subscription {
        provider_subscription_id: String,
        update: SubscriptionUpdate,
    },
    Payment {
        payment_ref: String,
        target: PaymentStatus,
    },
    /// Transient provider state; nothing to finalize yet.
    NotFinal { detail: String },
    /// Event type this engine does not consume.
    Unhandled,
}

fn str_field<'a>(object: &'a JsonValue, field: &str) -> Option<&'a str> {
    object.get(field).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
}

fn required<'a>(object: &'a JsonValue, field: &str, event: &ProviderEvent) -> Result<&'a str, BillingError> {
    str_field(object, field).ok_or_else(|| {
        BillingError::MalformedEvent(format!("{} {}: data.object.{field} missing", event.event_type, event.id))
    })
}

fn timestamp(object: &JsonValue, field: &str) -> Option<DateTime<Utc>> {
    object
        .get(field)
        .and_then(JsonValue::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Interpret a provider event into an action.
pub fn interpret(event: &ProviderEvent) -> Result<ProviderAction, BillingError> {
    let object = &event.data.object;

    let action = match event.event_type.as_str() {
        "customer.subscription.created" | "customer.subscription.updated" => {
            let id = required(object, "id", event)?;
            let status = match required(object, "status", event)? {
                "trialing" => SubscriptionStatus::Trialing,
                "active" => SubscriptionStatus::Active,
                "past_due" | "unpaid" => SubscriptionStatus::PastDue,
                "canceled" => SubscriptionStatus::Canceled,
                other => {
                    return Ok(ProviderAction::NotFinal {
                        detail: format!("subscription status '{other}'"),
                    });
                }
            };
            ProviderAction::Subscription {
                provider_subscription_id: id.to_string(),
                update: SubscriptionUpdate {
                    status: Some(status),
                    cancel_at_period_end: object.get("cancel_at_period_end").and_then(JsonValue::as_bool),
                    current_period_end: timestamp(object, "current_period_end"),
                },
            }
        }
        "customer.subscription.deleted" => ProviderAction::Subscription {
            provider_subscription_id: required(object, "id", event)?.to_string(),
            update: SubscriptionUpdate {
                status: Some(SubscriptionStatus::Canceled),
                ..Default::default()
            },
        },
        "invoice.paid" | "invoice.payment_succeeded" | "invoice.payment_failed" => {
            // One-off invoices carry no subscription.
            let Some(sub) = str_field(object, "subscription") else {
                return Ok(ProviderAction::Unhandled);
            };
            let status = if event.event_type == "invoice.payment_failed" {
                SubscriptionStatus::PastDue
            } else {
                SubscriptionStatus::Active
            };
            ProviderAction::Subscription {
                provider_subscription_id: sub.to_string(),
                update: SubscriptionUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            }
        }
        "payment_intent.succeeded" => ProviderAction::Payment {
            payment_ref: required(object, "id", event)?.to_string(),
            target: PaymentStatus::Paid,
        },
        "payment_intent.payment_failed" | "payment_intent.canceled" => ProviderAction::Payment {
            payment_ref: required(object, "id", event)?.to_string(),
            target: PaymentStatus::Failed,
        },
        "payment_intent.created" | "payment_intent.processing" | "payment_intent.requires_action" => {
            ProviderAction::NotFinal {
                detail: event.event_type.clone(),
            }
        }
        "checkout.session.completed" => {
            let payment_ref = required(object, "payment_intent", event)?;
            match str_field(object, "payment_status") {
                Some("paid") => ProviderAction::Payment {
                    payment_ref: payment_ref.to_string(),
                    target: PaymentStatus::Paid,
                },
                other => ProviderAction::NotFinal {
                    detail: format!("checkout payment_status {}", other.unwrap_or("missing")),
                },
            }
        }
        _ => ProviderAction::Unhandled,
    };

    Ok(action)
}
