//! Drives refund cases and books their payout on the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use waypost_core::{AccountId, Aggregate, AggregateRoot, OrgId, Outcome, RefundCaseId, SourceRef};
use waypost_events::{AuditScope, AuditSink, emit};
use waypost_ledger::{LedgerPosting, PostingKey, PostingRequest};
use waypost_refunds::{
    BookingAmounts, CancellationPolicy, ManualRequest, MarkPaid, OpenCase, RefundCase, RefundCaseCommand,
    RefundCaseEvent, RefundError, RefundStatus, compute_refund,
};

use crate::error::EngineError;
use crate::posting_engine::PostingEngine;

/// Posting event of a refund payout.
pub const REFUND_PAID: &str = "REFUND_PAID";

/// Accounts a payout moves money between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoutAccounts {
    pub platform: AccountId,
    pub customer: AccountId,
}

#[derive(Clone)]
pub struct RefundWorkflow {
    ledger: PostingEngine,
    audit: Arc<dyn AuditSink>,
}

impl RefundWorkflow {
    pub fn new(ledger: PostingEngine, audit: Arc<dyn AuditSink>) -> Self {
        Self { ledger, audit }
    }

    /// Compute the refund from the booking's policy snapshot and open a case
    /// carrying the result.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        org_id: OrgId,
        case_id: RefundCaseId,
        booking: SourceRef,
        amounts: &BookingAmounts,
        policy_snapshot: Option<&JsonValue>,
        manual: Option<ManualRequest>,
        now: DateTime<Utc>,
    ) -> Result<RefundCase, EngineError> {
        let policy = policy_snapshot.and_then(CancellationPolicy::from_snapshot);
        let computation = compute_refund(amounts, policy.as_ref(), now, manual);
        info!(
            %org_id,
            %booking,
            refundable = %computation.refundable,
            penalty = %computation.penalty,
            basis = computation.basis.as_str(),
            "refund computed"
        );

        let mut case = RefundCase::empty(case_id);
        self.execute(
            &mut case,
            org_id,
            &RefundCaseCommand::Open(OpenCase {
                org_id,
                case_id,
                booking,
                computation,
                occurred_at: now,
            }),
        )?;
        Ok(case)
    }

    /// Run one command and audit the events it produced.
    pub fn execute(
        &self,
        case: &mut RefundCase,
        org_id: OrgId,
        command: &RefundCaseCommand,
    ) -> Result<Vec<RefundCaseEvent>, EngineError> {
        let events = case.execute(command)?;
        for event in &events {
            emit(self.audit.as_ref(), AuditScope::Org(org_id), case.id().to_string(), event);
        }
        Ok(events)
    }

    /// Post the payout for an approved case and mark it paid. Safe to repeat:
    /// the posting is keyed on the case, and marking paid twice is a no-op.
    pub async fn pay(
        &self,
        case: &mut RefundCase,
        accounts: PayoutAccounts,
        occurred_at: DateTime<Utc>,
    ) -> Result<Outcome<LedgerPosting>, EngineError> {
        let org_id = case.org_id().ok_or(RefundError::NotOpened(*case.id()))?;
        let key = PostingKey::new(org_id, case.ledger_source()?, REFUND_PAID)?;

        if case.payout_posting().is_some() {
            let posting = self
                .ledger
                .posting(&key)
                .await?
                .ok_or_else(|| EngineError::PostingNotFound(key.to_string()))?;
            return Ok(Outcome::AlreadyApplied(posting));
        }
        if case.status() != RefundStatus::Approved {
            return Err(RefundError::InvalidTransition {
                from: case.status(),
                action: "pay",
            }
            .into());
        }

        let lines = case
            .computation()
            .map(|c| c.payout_lines(accounts.platform, accounts.customer))
            .unwrap_or_default();
        let outcome = self.ledger.post(PostingRequest::new(key, occurred_at, lines)).await?;

        if let Some(posting) = outcome.value() {
            let case_id = *case.id();
            self.execute(
                case,
                org_id,
                &RefundCaseCommand::MarkPaid(MarkPaid {
                    case_id,
                    posting_id: posting.id,
                    occurred_at,
                }),
            )?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use waypost_core::Currency;
    use waypost_events::RecordingAuditSink;
    use waypost_ledger::{AccountType, OpenAccount};
    use waypost_refunds::RefundBasis;

    use crate::store::InMemoryLedgerStore;

    struct Fixture {
        workflow: RefundWorkflow,
        ledger: PostingEngine,
        audit: Arc<RecordingAuditSink>,
        org: OrgId,
        accounts: PayoutAccounts,
    }

    async fn fixture() -> Fixture {
        let audit = Arc::new(RecordingAuditSink::default());
        let ledger = PostingEngine::new(Arc::new(InMemoryLedgerStore::new()), audit.clone());
        let org = OrgId::new();
        let mut ids = Vec::new();
        for (account_type, code) in [(AccountType::Platform, "PLAT"), (AccountType::Customer, "CUST")] {
            let account = ledger
                .open_account(OpenAccount {
                    org_id: org,
                    account_type,
                    code: code.into(),
                    currency: Currency::EUR,
                    owner_id: None,
                })
                .await
                .unwrap()
                .into_value()
                .unwrap();
            ids.push(account.id);
        }
        Fixture {
            workflow: RefundWorkflow::new(ledger.clone(), audit.clone()),
            ledger,
            audit,
            org,
            accounts: PayoutAccounts {
                platform: ids[0],
                customer: ids[1],
            },
        }
    }

    fn approve(f: &Fixture, case: &mut RefundCase) {
        let id = *case.id();
        f.workflow
            .execute(case, f.org, &RefundCaseCommand::SubmitForApproval { case_id: id, occurred_at: Utc::now() })
            .unwrap();
        f.workflow
            .execute(
                case,
                f.org,
                &RefundCaseCommand::Approve {
                    case_id: id,
                    approved_by: "ops".into(),
                    occurred_at: Utc::now(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn percent_policy_case_pays_out_the_refundable_once() {
        let f = fixture().await;
        let mut case = f
            .workflow
            .open(
                f.org,
                RefundCaseId::new(),
                SourceRef::new("booking", "BK-1").unwrap(),
                &BookingAmounts {
                    currency: Currency::EUR,
                    sell: dec!(100),
                },
                Some(&json!({"type": "percent", "value": 20})),
                None,
                Utc::now(),
            )
            .unwrap();
        let computation = case.computation().unwrap().clone();
        assert_eq!(computation.penalty, dec!(20.00));
        assert_eq!(computation.refundable, dec!(80.00));
        assert_eq!(computation.basis, RefundBasis::Policy);

        approve(&f, &mut case);
        let paid = f.workflow.pay(&mut case, f.accounts, Utc::now()).await.unwrap();
        assert!(paid.is_applied());
        assert_eq!(case.status(), RefundStatus::Paid);

        let again = f.workflow.pay(&mut case, f.accounts, Utc::now()).await.unwrap();
        assert!(again.is_already_applied());
        assert_eq!(again.value().unwrap().id, paid.value().unwrap().id);

        let customer = f.ledger.balance(f.org, f.accounts.customer, Currency::EUR).await.unwrap();
        assert_eq!(customer.net(), dec!(-80.00));
        assert_eq!(f.audit.of_type("refunds.case.paid").len(), 1);
    }

    #[tokio::test]
    async fn unapproved_case_cannot_be_paid() {
        let f = fixture().await;
        let mut case = f
            .workflow
            .open(
                f.org,
                RefundCaseId::new(),
                SourceRef::new("booking", "BK-2").unwrap(),
                &BookingAmounts {
                    currency: Currency::EUR,
                    sell: dec!(50),
                },
                None,
                Some(ManualRequest {
                    requested: Some(dec!(30)),
                }),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(case.computation().unwrap().basis, RefundBasis::Manual);

        let err = f.workflow.pay(&mut case, f.accounts, Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REFUND_TRANSITION");
    }
}
