use thiserror::Error;

use waypost_core::{DomainError, RefundCaseId};

use crate::case::RefundStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefundError {
    #[error("refund case {0} has not been opened")]
    NotOpened(RefundCaseId),

    #[error("cannot {action} a refund case in status {from:?}")]
    InvalidTransition {
        from: RefundStatus,
        action: &'static str,
    },

    #[error("command targets case {command}, aggregate is {aggregate}")]
    CaseMismatch {
        aggregate: RefundCaseId,
        command: RefundCaseId,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RefundError {
    pub fn code(&self) -> &'static str {
        match self {
            RefundError::NotOpened(_) => "REFUND_CASE_NOT_FOUND",
            RefundError::InvalidTransition { .. } => "INVALID_REFUND_TRANSITION",
            RefundError::CaseMismatch { .. } => "REFUND_CASE_MISMATCH",
            RefundError::Domain(_) => "VALIDATION_FAILED",
        }
    }
}
