//! Refund case workflow.
//!
//! `open → pending_approval → approved | rejected`, `approved → paid`,
//! `paid | rejected → closed`. Each handler is idempotent: re-issuing a
//! transition that already happened yields no events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::{Aggregate, AggregateRoot, OrgId, PostingId, RefundCaseId, SourceRef};
use waypost_events::Event;

use crate::calculator::RefundComputation;
use crate::error::RefundError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Open,
    PendingApproval,
    Approved,
    Rejected,
    Paid,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundCase {
    id: RefundCaseId,
    org_id: Option<OrgId>,
    booking: Option<SourceRef>,
    status: RefundStatus,
    computation: Option<RefundComputation>,
    payout_posting: Option<PostingId>,
    submitted_at: Option<DateTime<Utc>>,
    decided_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl RefundCase {
    /// Not-yet-opened instance for rehydration.
    pub fn empty(id: RefundCaseId) -> Self {
        Self {
            id,
            org_id: None,
            booking: None,
            status: RefundStatus::Open,
            computation: None,
            payout_posting: None,
            submitted_at: None,
            decided_at: None,
            paid_at: None,
            closed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn org_id(&self) -> Option<OrgId> {
        self.org_id
    }

    pub fn booking(&self) -> Option<&SourceRef> {
        self.booking.as_ref()
    }

    pub fn status(&self) -> RefundStatus {
        self.status
    }

    pub fn computation(&self) -> Option<&RefundComputation> {
        self.computation.as_ref()
    }

    pub fn payout_posting(&self) -> Option<PostingId> {
        self.payout_posting
    }

    /// Ledger source for the payout posting of this case.
    pub fn ledger_source(&self) -> Result<SourceRef, RefundError> {
        Ok(SourceRef::new("refund_case", self.id.to_string())?)
    }
}

impl AggregateRoot for RefundCase {
    type Id = RefundCaseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenCase {
    pub org_id: OrgId,
    pub case_id: RefundCaseId,
    pub booking: SourceRef,
    pub computation: RefundComputation,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPaid {
    pub case_id: RefundCaseId,
    pub posting_id: PostingId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseCase {
    pub case_id: RefundCaseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundCaseCommand {
    Open(OpenCase),
    SubmitForApproval {
        case_id: RefundCaseId,
        occurred_at: DateTime<Utc>,
    },
    Approve {
        case_id: RefundCaseId,
        approved_by: String,
        occurred_at: DateTime<Utc>,
    },
    Reject {
        case_id: RefundCaseId,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    MarkPaid(MarkPaid),
    Close(CloseCase),
}

impl RefundCaseCommand {
    fn case_id(&self) -> RefundCaseId {
        match self {
            RefundCaseCommand::Open(c) => c.case_id,
            RefundCaseCommand::SubmitForApproval { case_id, .. }
            | RefundCaseCommand::Approve { case_id, .. }
            | RefundCaseCommand::Reject { case_id, .. } => *case_id,
            RefundCaseCommand::MarkPaid(c) => c.case_id,
            RefundCaseCommand::Close(c) => c.case_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefundCaseEvent {
    Opened {
        org_id: OrgId,
        case_id: RefundCaseId,
        booking: SourceRef,
        computation: RefundComputation,
        occurred_at: DateTime<Utc>,
    },
    SubmittedForApproval {
        case_id: RefundCaseId,
        occurred_at: DateTime<Utc>,
    },
    Approved {
        case_id: RefundCaseId,
        approved_by: String,
        occurred_at: DateTime<Utc>,
    },
    Rejected {
        case_id: RefundCaseId,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    Paid {
        case_id: RefundCaseId,
        posting_id: PostingId,
        occurred_at: DateTime<Utc>,
    },
    Closed {
        case_id: RefundCaseId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for RefundCaseEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RefundCaseEvent::Opened { .. } => "refunds.case.opened",
            RefundCaseEvent::SubmittedForApproval { .. } => "refunds.case.submitted",
            RefundCaseEvent::Approved { .. } => "refunds.case.approved",
            RefundCaseEvent::Rejected { .. } => "refunds.case.rejected",
            RefundCaseEvent::Paid { .. } => "refunds.case.paid",
            RefundCaseEvent::Closed { .. } => "refunds.case.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RefundCaseEvent::Opened { occurred_at, .. }
            | RefundCaseEvent::SubmittedForApproval { occurred_at, .. }
            | RefundCaseEvent::Approved { occurred_at, .. }
            | RefundCaseEvent::Rejected { occurred_at, .. }
            | RefundCaseEvent::Paid { occurred_at, .. }
            | RefundCaseEvent::Closed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for RefundCase {
    type Command = RefundCaseCommand;
    type Event = RefundCaseEvent;
    type Error = RefundError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RefundCaseEvent::Opened {
                org_id,
                case_id,
                booking,
                computation,
                ..
            } => {
                self.id = *case_id;
                self.org_id = Some(*org_id);
                self.booking = Some(booking.clone());
                self.computation = Some(computation.clone());
                self.status = RefundStatus::Open;
                self.created = true;
            }
            RefundCaseEvent::SubmittedForApproval { occurred_at, .. } => {
                self.status = RefundStatus::PendingApproval;
                self.submitted_at = Some(*occurred_at);
            }
            RefundCaseEvent::Approved { occurred_at, .. } => {
                self.status = RefundStatus::Approved;
                self.decided_at = Some(*occurred_at);
            }
            RefundCaseEvent::Rejected { occurred_at, .. } => {
                self.status = RefundStatus::Rejected;
                self.decided_at = Some(*occurred_at);
            }
            RefundCaseEvent::Paid {
                posting_id,
                occurred_at,
                ..
            } => {
                self.status = RefundStatus::Paid;
                self.payout_posting = Some(*posting_id);
                self.paid_at = Some(*occurred_at);
            }
            RefundCaseEvent::Closed { occurred_at, .. } => {
                self.status = RefundStatus::Closed;
                self.closed_at = Some(*occurred_at);
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if let RefundCaseCommand::Open(cmd) = command {
            return self.handle_open(cmd);
        }

        if !self.created {
            return Err(RefundError::NotOpened(self.id));
        }
        if command.case_id() != self.id {
            return Err(RefundError::CaseMismatch {
                aggregate: self.id,
                command: command.case_id(),
            });
        }

        match command {
            RefundCaseCommand::Open(_) => Ok(vec![]),
            RefundCaseCommand::SubmitForApproval { case_id, occurred_at } => {
                if self.submitted_at.is_some() {
                    return Ok(vec![]);
                }
                self.require(RefundStatus::Open, "submit")?;
                Ok(vec![RefundCaseEvent::SubmittedForApproval {
                    case_id: *case_id,
                    occurred_at: *occurred_at,
                }])
            }
            RefundCaseCommand::Approve {
                case_id,
                approved_by,
                occurred_at,
            } => {
                if self.was_approved() {
                    return Ok(vec![]);
                }
                self.require(RefundStatus::PendingApproval, "approve")?;
                Ok(vec![RefundCaseEvent::Approved {
                    case_id: *case_id,
                    approved_by: approved_by.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            RefundCaseCommand::Reject {
                case_id,
                reason,
                occurred_at,
            } => {
                if self.decided_at.is_some() && !self.was_approved() {
                    return Ok(vec![]);
                }
                self.require(RefundStatus::PendingApproval, "reject")?;
                Ok(vec![RefundCaseEvent::Rejected {
                    case_id: *case_id,
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            RefundCaseCommand::MarkPaid(cmd) => {
                if self.paid_at.is_some() {
                    return Ok(vec![]);
                }
                self.require(RefundStatus::Approved, "pay")?;
                Ok(vec![RefundCaseEvent::Paid {
                    case_id: cmd.case_id,
                    posting_id: cmd.posting_id,
                    occurred_at: cmd.occurred_at,
                }])
            }
            RefundCaseCommand::Close(cmd) => {
                if self.closed_at.is_some() {
                    return Ok(vec![]);
                }
                if !matches!(self.status, RefundStatus::Paid | RefundStatus::Rejected) {
                    return Err(RefundError::InvalidTransition {
                        from: self.status,
                        action: "close",
                    });
                }
                Ok(vec![RefundCaseEvent::Closed {
                    case_id: cmd.case_id,
                    occurred_at: cmd.occurred_at,
                }])
            }
        }
    }
}

impl RefundCase {
    fn handle_open(&self, cmd: &OpenCase) -> Result<Vec<RefundCaseEvent>, RefundError> {
        if self.created {
            if self.id != cmd.case_id {
                return Err(RefundError::CaseMismatch {
                    aggregate: self.id,
                    command: cmd.case_id,
                });
            }
            return Ok(vec![]);
        }
        Ok(vec![RefundCaseEvent::Opened {
            org_id: cmd.org_id,
            case_id: cmd.case_id,
            booking: cmd.booking.clone(),
            computation: cmd.computation.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn require(&self, expected: RefundStatus, action: &'static str) -> Result<(), RefundError> {
        if self.status != expected {
            return Err(RefundError::InvalidTransition {
                from: self.status,
                action,
            });
        }
        Ok(())
    }

    /// Approval is the only decision that can lead to `paid`.
    fn was_approved(&self) -> bool {
        matches!(self.status, RefundStatus::Approved | RefundStatus::Paid)
            || (self.status == RefundStatus::Closed && self.paid_at.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{BookingAmounts, compute_refund};
    use rust_decimal_macros::dec;
    use waypost_core::Currency;

    fn opened() -> (RefundCase, RefundCaseId) {
        let id = RefundCaseId::new();
        let mut case = RefundCase::empty(id);
        let computation = compute_refund(
            &BookingAmounts {
                currency: Currency::EUR,
                sell: dec!(100),
            },
            None,
            Utc::now(),
            None,
        );
        case.execute(&RefundCaseCommand::Open(OpenCase {
            org_id: OrgId::new(),
            case_id: id,
            booking: SourceRef::new("booking", "BK-9").unwrap(),
            computation,
            occurred_at: Utc::now(),
        }))
        .unwrap();
        (case, id)
    }

    fn submit(id: RefundCaseId) -> RefundCaseCommand {
        RefundCaseCommand::SubmitForApproval {
            case_id: id,
            occurred_at: Utc::now(),
        }
    }

    fn approve(id: RefundCaseId) -> RefundCaseCommand {
        RefundCaseCommand::Approve {
            case_id: id,
            approved_by: "ops@agency".into(),
            occurred_at: Utc::now(),
        }
    }

    fn reject(id: RefundCaseId) -> RefundCaseCommand {
        RefundCaseCommand::Reject {
            case_id: id,
            reason: "outside policy".into(),
            occurred_at: Utc::now(),
        }
    }

    fn pay(id: RefundCaseId) -> RefundCaseCommand {
        RefundCaseCommand::MarkPaid(MarkPaid {
            case_id: id,
            posting_id: PostingId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn close(id: RefundCaseId) -> RefundCaseCommand {
        RefundCaseCommand::Close(CloseCase {
            case_id: id,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn happy_path_reaches_closed() {
        let (mut case, id) = opened();
        for cmd in [submit(id), approve(id), pay(id), close(id)] {
            assert_eq!(case.execute(&cmd).unwrap().len(), 1);
        }
        assert_eq!(case.status(), RefundStatus::Closed);
        assert!(case.payout_posting().is_some());
        assert_eq!(case.version(), 5);
    }

    #[test]
    fn reissued_transitions_are_no_ops() {
        let (mut case, id) = opened();
        case.execute(&submit(id)).unwrap();
        assert!(case.execute(&submit(id)).unwrap().is_empty());

        case.execute(&approve(id)).unwrap();
        assert!(case.execute(&approve(id)).unwrap().is_empty());
        assert!(case.execute(&submit(id)).unwrap().is_empty());

        let first_pay = pay(id);
        case.execute(&first_pay).unwrap();
        let posting = case.payout_posting();
        assert!(case.execute(&pay(id)).unwrap().is_empty());
        assert_eq!(case.payout_posting(), posting);

        case.execute(&close(id)).unwrap();
        assert!(case.execute(&close(id)).unwrap().is_empty());
        assert!(case.execute(&approve(id)).unwrap().is_empty());
        assert_eq!(case.status(), RefundStatus::Closed);
    }

    #[test]
    fn reopen_is_a_no_op() {
        let (case, id) = opened();
        let cmd = RefundCaseCommand::Open(OpenCase {
            org_id: OrgId::new(),
            case_id: id,
            booking: SourceRef::new("booking", "BK-9").unwrap(),
            computation: case.computation().cloned().unwrap(),
            occurred_at: Utc::now(),
        });
        assert!(case.handle(&cmd).unwrap().is_empty());
    }

    #[test]
    fn rejected_case_cannot_be_paid_or_approved() {
        let (mut case, id) = opened();
        case.execute(&submit(id)).unwrap();
        case.execute(&reject(id)).unwrap();
        assert!(case.execute(&reject(id)).unwrap().is_empty());

        let err = case.handle(&approve(id)).unwrap_err();
        assert_eq!(err.code(), "INVALID_REFUND_TRANSITION");
        assert!(case.handle(&pay(id)).is_err());

        case.execute(&close(id)).unwrap();
        assert_eq!(case.status(), RefundStatus::Closed);
        assert!(case.handle(&approve(id)).is_err());
    }

    #[test]
    fn approved_case_cannot_be_rejected() {
        let (mut case, id) = opened();
        case.execute(&submit(id)).unwrap();
        case.execute(&approve(id)).unwrap();
        assert!(matches!(
            case.handle(&reject(id)),
            Err(RefundError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn transitions_out_of_order_are_rejected() {
        let (case, id) = opened();
        assert!(case.handle(&approve(id)).is_err());
        assert!(case.handle(&pay(id)).is_err());
        assert!(case.handle(&close(id)).is_err());
    }

    #[test]
    fn commands_require_an_opened_case_with_matching_id() {
        let id = RefundCaseId::new();
        let empty = RefundCase::empty(id);
        assert_eq!(empty.handle(&submit(id)), Err(RefundError::NotOpened(id)));

        let (case, _) = opened();
        assert!(matches!(
            case.handle(&submit(RefundCaseId::new())),
            Err(RefundError::CaseMismatch { .. })
        ));
    }
}
