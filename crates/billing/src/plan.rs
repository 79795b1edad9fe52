use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{Currency, DomainError, TenantId};

use crate::error::BillingError;

/// How a tenant's usage is pushed to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    /// Every unit at price 0, for analytics parity before monetizing.
    Shadow,
    /// Only the overage beyond the included quota, at the plan price.
    Real,
}

impl PushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushMode::Shadow => "shadow",
            PushMode::Real => "real",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "shadow" => Ok(PushMode::Shadow),
            "real" => Ok(PushMode::Real),
            other => Err(DomainError::validation(format!("unknown push mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPrice {
    /// Units included per period.
    pub included: u64,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPlan {
    pub tenant_id: TenantId,
    pub tier: String,
    /// Non-metered tiers record no usage at all.
    pub metered: bool,
    pub mode: PushMode,
    pub currency: Currency,
    pub prices: BTreeMap<String, MetricPrice>,
}

impl TenantPlan {
    pub fn new(tenant_id: TenantId, tier: impl Into<String>, mode: PushMode, currency: Currency) -> Self {
        Self {
            tenant_id,
            tier: tier.into(),
            metered: true,
            mode,
            currency,
            prices: BTreeMap::new(),
        }
    }

    pub fn unmetered(tenant_id: TenantId, tier: impl Into<String>, currency: Currency) -> Self {
        Self {
            metered: false,
            ..Self::new(tenant_id, tier, PushMode::Shadow, currency)
        }
    }

    pub fn with_price(mut self, metric: impl Into<String>, included: u64, unit_price: Decimal) -> Self {
        self.prices.insert(metric.into(), MetricPrice { included, unit_price });
        self
    }

    pub fn price(&self, metric: &str) -> Result<&MetricPrice, BillingError> {
        self.prices
            .get(metric)
            .ok_or_else(|| BillingError::MetricNotPriced(metric.to_string()))
    }
}
