use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::instrument;

use waypost_billing::{
    BillingSubscription, BookingPayment, PaymentStatus, SubscriptionStatus, WebhookDecision, WebhookEventRecord,
};

use super::{doc_of, is_unique_violation, map_sqlx_error, to_doc};
use crate::store::{Claim, Inserted, PaymentStore, StoreError, SubscriptionStore, WebhookEventStore};

#[derive(Debug, Clone)]
pub struct PostgresSubscriptionStore {
    pool: Arc<PgPool>,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn insert(&self, sub: &BillingSubscription) -> Result<Inserted<BillingSubscription>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_subscriptions (provider, provider_subscription_id, tenant_id, status, doc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&sub.provider)
        .bind(&sub.provider_subscription_id)
        .bind(sub.tenant_id.as_uuid())
        .bind(sub.status.as_str())
        .bind(to_doc(sub)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(Inserted::New(sub.clone())),
            Err(e) if is_unique_violation(&e) => self
                .by_provider_id(&sub.provider, &sub.provider_subscription_id)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Conflict(format!("subscription {} raced", sub.provider_subscription_id))),
            Err(e) => Err(map_sqlx_error("insert_subscription", e)),
        }
    }

    async fn by_provider_id(
        &self,
        provider: &str,
        provider_subscription_id: &str,
    ) -> Result<Option<BillingSubscription>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM billing_subscriptions WHERE provider = $1 AND provider_subscription_id = $2",
        )
        .bind(provider)
        .bind(provider_subscription_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("subscription_by_provider_id", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    #[instrument(skip(self, sub), fields(subscription = %sub.provider_subscription_id, expected = expected.as_str()), err)]
    async fn compare_and_set(&self, sub: &BillingSubscription, expected: SubscriptionStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE billing_subscriptions SET status = $3, doc = $4
            WHERE provider = $1 AND provider_subscription_id = $2 AND status = $5
            "#,
        )
        .bind(&sub.provider)
        .bind(&sub.provider_subscription_id)
        .bind(sub.status.as_str())
        .bind(to_doc(sub)?)
        .bind(expected.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("subscription_cas", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.by_provider_id(&sub.provider, &sub.provider_subscription_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("subscription {}", sub.provider_subscription_id))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPaymentStore {
    pool: Arc<PgPool>,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn insert(&self, payment: &BookingPayment) -> Result<Inserted<BookingPayment>, StoreError> {
        let result = sqlx::query(
            "INSERT INTO booking_payments (provider_payment_ref, org_id, status, doc) VALUES ($1, $2, $3, $4)",
        )
        .bind(&payment.provider_payment_ref)
        .bind(payment.org_id.as_uuid())
        .bind(payment.status.as_str())
        .bind(to_doc(payment)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(Inserted::New(payment.clone())),
            Err(e) if is_unique_violation(&e) => self
                .by_provider_ref(&payment.provider_payment_ref)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Conflict(format!("payment {} raced", payment.provider_payment_ref))),
            Err(e) => Err(map_sqlx_error("insert_payment", e)),
        }
    }

    async fn by_provider_ref(&self, payment_ref: &str) -> Result<Option<BookingPayment>, StoreError> {
        let row = sqlx::query("SELECT doc FROM booking_payments WHERE provider_payment_ref = $1")
            .bind(payment_ref)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("payment_by_ref", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }

    async fn compare_and_set(&self, payment: &BookingPayment, expected: PaymentStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE booking_payments SET status = $2, doc = $3
            WHERE provider_payment_ref = $1 AND status = $4
            "#,
        )
        .bind(&payment.provider_payment_ref)
        .bind(payment.status.as_str())
        .bind(to_doc(payment)?)
        .bind(expected.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("payment_cas", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.by_provider_ref(&payment.provider_payment_ref).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("payment {}", payment.provider_payment_ref))),
        }
    }
}

/// Provider event idempotency records, unique on `(provider, event_id)`.
#[derive(Debug, Clone)]
pub struct PostgresWebhookEventStore {
    pool: Arc<PgPool>,
}

impl PostgresWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl WebhookEventStore for PostgresWebhookEventStore {
    #[instrument(skip(self, record, now), fields(provider = %record.provider, event_id = %record.event_id), err)]
    async fn claim(
        &self,
        record: &WebhookEventRecord,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("webhook.claim.begin", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (provider, event_id, decision, claimed_at, doc)
            VALUES ($1, $2, NULL, $3, $4)
            ON CONFLICT (provider, event_id) DO NOTHING
            "#,
        )
        .bind(&record.provider)
        .bind(&record.event_id)
        .bind(record.claimed_at)
        .bind(to_doc(record)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("webhook.claim.insert", e))?;

        let claim = if inserted.rows_affected() == 1 {
            Claim::Fresh(record.clone())
        } else {
            let row = sqlx::query("SELECT doc FROM webhook_events WHERE provider = $1 AND event_id = $2 FOR UPDATE")
                .bind(&record.provider)
                .bind(&record.event_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("webhook.claim.select", e))?;
            let mut stored: WebhookEventRecord = doc_of(&row)?;
            stored.deliveries += 1;
            let reclaimed = stored.reclaimable(now, stale_after);
            if reclaimed {
                stored.decision = None;
                stored.detail = None;
                stored.claimed_at = now;
            }
            sqlx::query(
                r#"
                UPDATE webhook_events SET decision = $3, claimed_at = $4, doc = $5
                WHERE provider = $1 AND event_id = $2
                "#,
            )
            .bind(&stored.provider)
            .bind(&stored.event_id)
            .bind(stored.decision.map(|d| d.as_str()))
            .bind(stored.claimed_at)
            .bind(to_doc(&stored)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("webhook.claim.update", e))?;
            if reclaimed {
                Claim::Reclaimed(stored)
            } else {
                Claim::Duplicate(stored)
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("webhook.claim.commit", e))?;
        Ok(claim)
    }

    async fn record_decision(
        &self,
        provider: &str,
        event_id: &str,
        decision: WebhookDecision,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET decision = $3,
                doc = doc || jsonb_build_object('decision', $3::text, 'detail', $4::text)
            WHERE provider = $1 AND event_id = $2
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(decision.as_str())
        .bind(detail)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("webhook.record_decision", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("webhook event {provider}/{event_id}")));
        }
        Ok(())
    }

    async fn get(&self, provider: &str, event_id: &str) -> Result<Option<WebhookEventRecord>, StoreError> {
        let row = sqlx::query("SELECT doc FROM webhook_events WHERE provider = $1 AND event_id = $2")
            .bind(provider)
            .bind(event_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("webhook.get", e))?;
        row.map(|r| doc_of(&r)).transpose()
    }
}
