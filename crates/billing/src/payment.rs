use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::{DomainError, OrgId, SourceRef};

use crate::cas::{CasOutcome, compare};

/// Payment status of a booking as tracked by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unset,
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unset => "",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Empty and `unset` both read as [`PaymentStatus::Unset`].
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s.trim() {
            "" | "unset" => Ok(PaymentStatus::Unset),
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(DomainError::validation(format!("unknown payment status '{other}'"))),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Failed)
    }

    pub fn allowed_predecessors(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Unset => &[],
            Pending => &[Unset],
            Paid | Failed => &[Unset, Pending],
        }
    }
}

/// Payment side of a booking, addressed by the provider's payment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPayment {
    pub org_id: OrgId,
    pub booking: SourceRef,
    pub provider_payment_ref: String,
    pub status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
}

impl BookingPayment {
    pub fn new(
        org_id: OrgId,
        booking: SourceRef,
        provider_payment_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let provider_payment_ref = provider_payment_ref.into().trim().to_string();
        if provider_payment_ref.is_empty() {
            return Err(DomainError::validation("provider payment reference is required"));
        }
        Ok(Self {
            org_id,
            booking,
            provider_payment_ref,
            status: PaymentStatus::Unset,
            updated_at: now,
        })
    }

    pub fn transition(&mut self, target: PaymentStatus, now: DateTime<Utc>) -> CasOutcome<PaymentStatus> {
        let outcome = compare(self.status, target, target.allowed_predecessors());
        if outcome.is_applied() {
            self.status = target;
            self.updated_at = now;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> BookingPayment {
        BookingPayment::new(OrgId::new(), SourceRef::new("booking", "BK-3").unwrap(), "pi_1", Utc::now()).unwrap()
    }

    #[test]
    fn unset_and_pending_may_finalize() {
        let mut p = payment();
        assert!(p.transition(PaymentStatus::Pending, Utc::now()).is_applied());
        assert!(p.transition(PaymentStatus::Paid, Utc::now()).is_applied());

        let mut p = payment();
        assert!(p.transition(PaymentStatus::Failed, Utc::now()).is_applied());
    }

    #[test]
    fn final_states_never_regress() {
        let mut p = payment();
        p.transition(PaymentStatus::Paid, Utc::now());
        assert!(matches!(
            p.transition(PaymentStatus::Failed, Utc::now()),
            CasOutcome::OutOfOrder { .. }
        ));
        assert!(matches!(
            p.transition(PaymentStatus::Pending, Utc::now()),
            CasOutcome::OutOfOrder { .. }
        ));
        assert_eq!(p.transition(PaymentStatus::Paid, Utc::now()), CasOutcome::Unchanged);
        assert_eq!(p.status, PaymentStatus::Paid);
    }

    #[test]
    fn empty_string_reads_as_unset() {
        assert_eq!(PaymentStatus::parse("").unwrap(), PaymentStatus::Unset);
        assert_eq!(PaymentStatus::parse(PaymentStatus::Unset.as_str()).unwrap(), PaymentStatus::Unset);
    }
}
