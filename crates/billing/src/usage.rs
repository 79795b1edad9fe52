use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use waypost_core::{DomainError, SourceRef, TenantId, UsageRecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Pending,
    Pushed,
    /// Entirely inside the plan quota; nothing to bill.
    Skipped,
    Error,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Pending => "pending",
            PushStatus::Pushed => "pushed",
            PushStatus::Skipped => "skipped",
            PushStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(PushStatus::Pending),
            "pushed" => Ok(PushStatus::Pushed),
            "skipped" => Ok(PushStatus::Skipped),
            "error" => Ok(PushStatus::Error),
            other => Err(DomainError::validation(format!("unknown push status '{other}'"))),
        }
    }
}

/// Unique key of a usage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageKey {
    pub tenant_id: TenantId,
    pub metric: String,
    pub source_event_id: String,
}

impl UsageKey {
    /// Idempotency key sent with the provider push: hex SHA-256 of
    /// `tenant:metric:source_event_id`. Stable across retries and processes.
    pub fn provider_idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(self.metric.as_bytes());
        hasher.update(b":");
        hasher.update(self.source_event_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Validated input of `track_usage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUsage {
    pub key: UsageKey,
    pub quantity: u64,
    pub source: SourceRef,
    pub occurred_at: DateTime<Utc>,
}

impl NewUsage {
    pub fn new(
        tenant_id: TenantId,
        metric: impl Into<String>,
        quantity: u64,
        source: SourceRef,
        source_event_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let metric = metric.into().trim().to_string();
        let source_event_id = source_event_id.into().trim().to_string();
        if metric.is_empty() {
            return Err(DomainError::validation("usage metric must not be empty"));
        }
        if source_event_id.is_empty() {
            return Err(DomainError::validation("usage source_event_id must not be empty"));
        }
        if quantity == 0 {
            return Err(DomainError::validation("usage quantity must be positive"));
        }
        Ok(Self {
            key: UsageKey {
                tenant_id,
                metric,
                source_event_id,
            },
            quantity,
            source,
            occurred_at,
        })
    }

    pub fn into_record(self, now: DateTime<Utc>) -> UsageLedgerRecord {
        UsageLedgerRecord {
            id: UsageRecordId::new(),
            key: self.key,
            quantity: self.quantity,
            source: self.source,
            occurred_at: self.occurred_at,
            recorded_at: now,
            billed: false,
            billed_quantity: 0,
            planned_quantity: None,
            push_status: PushStatus::Pending,
            push_error: None,
            provider_ref: None,
            attempts: 0,
            pushed_at: None,
        }
    }
}

/// Per-tenant metered usage row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerRecord {
    pub id: UsageRecordId,
    pub key: UsageKey,
    pub quantity: u64,
    pub source: SourceRef,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    /// Settled with the provider (pushed or skipped). Never pushed again.
    pub billed: bool,
    /// Units actually charged by the provider push (0 for skipped records).
    pub billed_quantity: u64,
    /// Billable units fixed the first time a real-mode run planned this
    /// record. Retries push exactly this quantity under the same key.
    #[serde(default)]
    pub planned_quantity: Option<u64>,
    pub push_status: PushStatus,
    pub push_error: Option<String>,
    pub provider_ref: Option<String>,
    pub attempts: u32,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl UsageLedgerRecord {
    pub fn tenant_id(&self) -> TenantId {
        self.key.tenant_id
    }

    pub fn metric(&self) -> &str {
        &self.key.metric
    }

    /// Fix the billable share. A record is planned once; later calls keep the
    /// first value.
    pub fn mark_planned(&mut self, billable: u64) {
        if self.planned_quantity.is_none() {
            self.planned_quantity = Some(billable.min(self.quantity));
        }
    }

    /// Units of this record absorbed by the included quota.
    pub fn covered_quantity(&self) -> u64 {
        self.planned_quantity
            .map(|billable| self.quantity.saturating_sub(billable))
            .unwrap_or(0)
    }

    pub fn mark_pushed(&mut self, provider_ref: impl Into<String>, billed_quantity: u64, now: DateTime<Utc>) {
        self.billed = true;
        self.billed_quantity = billed_quantity;
        self.push_status = PushStatus::Pushed;
        self.push_error = None;
        self.provider_ref = Some(provider_ref.into());
        self.attempts += 1;
        self.pushed_at = Some(now);
    }

    pub fn mark_skipped(&mut self, now: DateTime<Utc>) {
        self.billed = true;
        self.billed_quantity = 0;
        self.push_status = PushStatus::Skipped;
        self.push_error = None;
        self.pushed_at = Some(now);
    }

    pub fn mark_error(&mut self, error: impl Into<String>, attempts: u32) {
        self.push_status = PushStatus::Error;
        self.push_error = Some(error.into());
        self.attempts += attempts;
    }
}
