//! Outbound port to the external billing provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use waypost_core::{Currency, TenantId};

use crate::retry::Transient;

/// One metered usage line sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsagePush {
    /// Provider-side dedupe key; identical across retries.
    pub idempotency_key: String,
    pub tenant_id: TenantId,
    pub metric: String,
    pub quantity: u64,
    pub unit_price: Decimal,
    pub currency: Currency,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, 429s, 5xx: worth another attempt.
    #[error("provider unavailable: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        "PROVIDER_UNAVAILABLE"
    }
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Push one usage line; returns the provider's reference for it.
    async fn push_usage(&self, push: &UsagePush) -> Result<String, ProviderError>;
}

/// Provider for local runs: logs the push and acknowledges it.
#[derive(Debug, Clone)]
pub struct LoggingProvider {
    name: String,
}

impl LoggingProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl BillingProvider for LoggingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push_usage(&self, push: &UsagePush) -> Result<String, ProviderError> {
        info!(
            provider = %self.name,
            tenant_id = %push.tenant_id,
            metric = %push.metric,
            quantity = push.quantity,
            unit_price = %push.unit_price,
            idempotency_key = %push.idempotency_key,
            "usage push (logging provider)"
        );
        Ok(format!("log_{}", push.idempotency_key.chars().take(16).collect::<String>()))
    }
}
