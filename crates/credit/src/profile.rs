use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{AgencyId, Currency, DomainError, OrgId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Active,
    Suspended,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Active => "active",
            CreditStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "active" => Ok(CreditStatus::Active),
            "suspended" => Ok(CreditStatus::Suspended),
            other => Err(DomainError::validation(format!("unknown credit status '{other}'"))),
        }
    }
}

/// Credit terms of one agency within one org.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditProfile {
    pub org_id: OrgId,
    pub agency_id: AgencyId,
    /// Hard ceiling: exposure may never exceed it.
    pub credit_limit: Decimal,
    /// Warning threshold, `0 <= soft_limit <= credit_limit`.
    pub soft_limit: Decimal,
    pub currency: Currency,
    pub payment_terms_days: u32,
    pub status: CreditStatus,
    pub updated_at: DateTime<Utc>,
}

impl CreditProfile {
    pub fn new(
        org_id: OrgId,
        agency_id: AgencyId,
        credit_limit: Decimal,
        soft_limit: Decimal,
        currency: Currency,
        payment_terms_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if credit_limit.is_sign_negative() {
            return Err(DomainError::validation("credit_limit must be non-negative"));
        }
        if soft_limit.is_sign_negative() || soft_limit > credit_limit {
            return Err(DomainError::validation(format!(
                "soft_limit {soft_limit} must lie within [0, {credit_limit}]"
            )));
        }
        Ok(Self {
            org_id,
            agency_id,
            credit_limit,
            soft_limit,
            currency,
            payment_terms_days,
            status: CreditStatus::Active,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == CreditStatus::Active
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) {
        self.status = CreditStatus::Suspended;
        self.updated_at = now;
    }

    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.status = CreditStatus::Active;
        self.updated_at = now;
    }
}
