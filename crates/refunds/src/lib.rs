//! Refunds: the pure cancellation-policy calculator and the refund case workflow.

pub mod calculator;
pub mod case;
pub mod error;
pub mod policy;

pub use calculator::{BookingAmounts, ManualRequest, RefundBasis, RefundComputation, compute_refund};
pub use case::{
    CloseCase, MarkPaid, OpenCase, RefundCase, RefundCaseCommand, RefundCaseEvent, RefundStatus,
};
pub use error::RefundError;
pub use policy::{CancellationPolicy, PolicyKind};
