//! Period lock document of the monthly finalize run.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::DomainError;

use crate::period::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    Running,
    Success,
    /// Some records failed to push; safe to retry.
    Partial,
    Failed,
}

impl FinalizeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeStatus::Running => "running",
            FinalizeStatus::Success => "success",
            FinalizeStatus::Partial => "partial",
            FinalizeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "running" => Ok(FinalizeStatus::Running),
            "success" => Ok(FinalizeStatus::Success),
            "partial" => Ok(FinalizeStatus::Partial),
            "failed" => Ok(FinalizeStatus::Failed),
            other => Err(DomainError::validation(format!("unknown finalize status '{other}'"))),
        }
    }
}

/// Counts reported by one finalize run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinalizeSummary {
    pub pushed: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl FinalizeSummary {
    pub fn status(&self) -> FinalizeStatus {
        if self.failed == 0 {
            FinalizeStatus::Success
        } else if self.pushed + self.skipped > 0 {
            FinalizeStatus::Partial
        } else {
            FinalizeStatus::Failed
        }
    }
}

/// One row per period, unique on the period label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodFinalizeRecord {
    pub period: BillingPeriod,
    pub status: FinalizeStatus,
    pub owner: String,
    pub lease_until: DateTime<Utc>,
    pub attempts: u32,
    pub summary: FinalizeSummary,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of trying to take the period lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodClaim {
    Claimed(PeriodFinalizeRecord),
    AlreadySucceeded(PeriodFinalizeRecord),
    /// Another owner holds an unexpired lease.
    Locked { owner: String, lease_until: DateTime<Utc> },
}

impl PeriodFinalizeRecord {
    pub fn new_claim(period: BillingPeriod, owner: &str, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            period,
            status: FinalizeStatus::Running,
            owner: owner.to_string(),
            lease_until: now + lease,
            attempts: 1,
            summary: FinalizeSummary::default(),
            last_error: None,
            updated_at: now,
        }
    }

    /// Decide a claim against the stored record. On `Claimed` the returned
    /// record is what must be written back (atomically, conditioned on the
    /// stored status/owner/lease still matching).
    pub fn claim(&self, owner: &str, now: DateTime<Utc>, lease: Duration) -> PeriodClaim {
        match self.status {
            FinalizeStatus::Success => PeriodClaim::AlreadySucceeded(self.clone()),
            FinalizeStatus::Running if self.lease_until > now && self.owner != owner => PeriodClaim::Locked {
                owner: self.owner.clone(),
                lease_until: self.lease_until,
            },
            _ => PeriodClaim::Claimed(Self {
                status: FinalizeStatus::Running,
                owner: owner.to_string(),
                lease_until: now + lease,
                attempts: self.attempts + 1,
                updated_at: now,
                ..self.clone()
            }),
        }
    }

    pub fn complete(&mut self, summary: FinalizeSummary, error: Option<String>, now: DateTime<Utc>) {
        self.status = if error.is_some() {
            FinalizeStatus::Failed
        } else {
            summary.status()
        };
        self.summary = summary;
        self.last_error = error;
        self.lease_until = now;
        self.updated_at = now;
    }
}
