use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use waypost_billing::{
    BillingSubscription, BookingPayment, PaymentStatus, SubscriptionStatus, WebhookDecision, WebhookEventRecord,
};

use super::{Inserted, StoreError};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Unique on `(provider, provider_subscription_id)`.
    async fn insert(&self, sub: &BillingSubscription) -> Result<Inserted<BillingSubscription>, StoreError>;

    async fn by_provider_id(
        &self,
        provider: &str,
        provider_subscription_id: &str,
    ) -> Result<Option<BillingSubscription>, StoreError>;

    /// Write `sub` only if the stored status still equals `expected`.
    async fn compare_and_set(&self, sub: &BillingSubscription, expected: SubscriptionStatus) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Unique on `provider_payment_ref`.
    async fn insert(&self, payment: &BookingPayment) -> Result<Inserted<BookingPayment>, StoreError>;

    async fn by_provider_ref(&self, payment_ref: &str) -> Result<Option<BookingPayment>, StoreError>;

    async fn compare_and_set(&self, payment: &BookingPayment, expected: PaymentStatus) -> Result<bool, StoreError>;
}

/// Outcome of claiming a provider event for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// First delivery.
    Fresh(WebhookEventRecord),
    /// Earlier attempt errored or went stale; process again.
    Reclaimed(WebhookEventRecord),
    /// Already decided, or still being processed by another delivery.
    Duplicate(WebhookEventRecord),
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn claim(
        &self,
        record: &WebhookEventRecord,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim, StoreError>;

    async fn record_decision(
        &self,
        provider: &str,
        event_id: &str,
        decision: WebhookDecision,
        detail: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get(&self, provider: &str, event_id: &str) -> Result<Option<WebhookEventRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    inner: RwLock<HashMap<(String, String), BillingSubscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, sub: &BillingSubscription) -> Result<Inserted<BillingSubscription>, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("subscriptions"))?;
        let key = (sub.provider.clone(), sub.provider_subscription_id.clone());
        if let Some(existing) = map.get(&key) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        map.insert(key, sub.clone());
        Ok(Inserted::New(sub.clone()))
    }

    async fn by_provider_id(
        &self,
        provider: &str,
        provider_subscription_id: &str,
    ) -> Result<Option<BillingSubscription>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("subscriptions"))?;
        Ok(map
            .get(&(provider.to_string(), provider_subscription_id.to_string()))
            .cloned())
    }

    async fn compare_and_set(&self, sub: &BillingSubscription, expected: SubscriptionStatus) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("subscriptions"))?;
        let key = (sub.provider.clone(), sub.provider_subscription_id.clone());
        match map.get_mut(&key) {
            Some(stored) if stored.status == expected => {
                *stored = sub.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("subscription {}", sub.provider_subscription_id))),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPaymentStore {
    inner: RwLock<HashMap<String, BookingPayment>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: &BookingPayment) -> Result<Inserted<BookingPayment>, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("payments"))?;
        if let Some(existing) = map.get(&payment.provider_payment_ref) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        map.insert(payment.provider_payment_ref.clone(), payment.clone());
        Ok(Inserted::New(payment.clone()))
    }

    async fn by_provider_ref(&self, payment_ref: &str) -> Result<Option<BookingPayment>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("payments"))?;
        Ok(map.get(payment_ref).cloned())
    }

    async fn compare_and_set(&self, payment: &BookingPayment, expected: PaymentStatus) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("payments"))?;
        match map.get_mut(&payment.provider_payment_ref) {
            Some(stored) if stored.status == expected => {
                *stored = payment.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("payment {}", payment.provider_payment_ref))),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWebhookEventStore {
    inner: RwLock<HashMap<(String, String), WebhookEventRecord>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn claim(
        &self,
        record: &WebhookEventRecord,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("webhook events"))?;
        let key = (record.provider.clone(), record.event_id.clone());
        match map.get_mut(&key) {
            None => {
                map.insert(key, record.clone());
                Ok(Claim::Fresh(record.clone()))
            }
            Some(stored) => {
                stored.deliveries += 1;
                if stored.reclaimable(now, stale_after) {
                    stored.decision = None;
                    stored.detail = None;
                    stored.claimed_at = now;
                    Ok(Claim::Reclaimed(stored.clone()))
                } else {
                    Ok(Claim::Duplicate(stored.clone()))
                }
            }
        }
    }

    async fn record_decision(
        &self,
        provider: &str,
        event_id: &str,
        decision: WebhookDecision,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::poisoned("webhook events"))?;
        let stored = map
            .get_mut(&(provider.to_string(), event_id.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {provider}/{event_id}")))?;
        stored.decision = Some(decision);
        stored.detail = detail;
        Ok(())
    }

    async fn get(&self, provider: &str, event_id: &str) -> Result<Option<WebhookEventRecord>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::poisoned("webhook events"))?;
        Ok(map.get(&(provider.to_string(), event_id.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypost_billing::{ProviderEvent, ProviderEventData};

    fn event(id: &str) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            event_type: "invoice.paid".to_string(),
            created: 0,
            data: ProviderEventData {
                object: serde_json::json!({}),
            },
        }
    }

    #[tokio::test]
    async fn decided_event_is_a_duplicate_but_errored_one_is_reclaimed() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let stale = Duration::minutes(5);

        let rec = WebhookEventRecord::claim("stripe", &event("evt_1"), now);
        assert!(matches!(store.claim(&rec, now, stale).await.unwrap(), Claim::Fresh(_)));
        store
            .record_decision("stripe", "evt_1", WebhookDecision::Applied, None)
            .await
            .unwrap();
        assert!(matches!(store.claim(&rec, now, stale).await.unwrap(), Claim::Duplicate(_)));

        let rec2 = WebhookEventRecord::claim("stripe", &event("evt_2"), now);
        store.claim(&rec2, now, stale).await.unwrap();
        store
            .record_decision("stripe", "evt_2", WebhookDecision::Error, Some("missing".into()))
            .await
            .unwrap();
        match store.claim(&rec2, now, stale).await.unwrap() {
            Claim::Reclaimed(r) => {
                assert_eq!(r.deliveries, 2);
                assert_eq!(r.decision, None);
            }
            other => panic!("expected reclaim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_flight_claim_goes_stale() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let rec = WebhookEventRecord::claim("stripe", &event("evt_3"), now);
        store.claim(&rec, now, Duration::minutes(5)).await.unwrap();

        let soon = now + Duration::minutes(1);
        assert!(matches!(store.claim(&rec, soon, Duration::minutes(5)).await.unwrap(), Claim::Duplicate(_)));
        let later = now + Duration::minutes(6);
        assert!(matches!(store.claim(&rec, later, Duration::minutes(5)).await.unwrap(), Claim::Reclaimed(_)));
    }
}
