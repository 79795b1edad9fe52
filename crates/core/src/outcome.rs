//! Typed result of an idempotent operation.
//!
//! Every idempotent write (posting, FX snapshot, usage record, webhook
//! application, period finalize) reports one of three outcomes instead of
//! signalling duplicates through errors. Real failures stay in `Result::Err`.

use serde::{Deserialize, Serialize};

/// Why an idempotent operation produced no effect without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The target was already in a state the event must not overwrite.
    OutOfOrder,
    /// The event describes a transient state; nothing to finalize.
    NotFinal,
    /// The tenant's plan tier is not metered.
    NotMetered,
    /// Another worker holds the lock for this key.
    LockHeld,
    /// The trigger fired too late (beyond the misfire grace window).
    Misfired,
    /// The feature is switched off by configuration.
    Disabled,
}

impl RejectionKind {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionKind::OutOfOrder => "OUT_OF_ORDER_EVENT",
            RejectionKind::NotFinal => "NOT_FINAL",
            RejectionKind::NotMetered => "NOT_METERED",
            RejectionKind::LockHeld => "LOCK_FAILED",
            RejectionKind::Misfired => "MISFIRED",
            RejectionKind::Disabled => "DISABLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// `Applied | AlreadyApplied | Rejected(reason)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum Outcome<T> {
    /// This call performed the write.
    Applied(T),
    /// An earlier call already performed it; `T` is the stored result.
    AlreadyApplied(T),
    /// Nothing was written, by rule rather than by failure.
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn rejected(kind: RejectionKind, detail: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection::new(kind, detail))
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn is_already_applied(&self) -> bool {
        matches!(self, Outcome::AlreadyApplied(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    /// The stored value, whether written now or earlier.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Applied(v) | Outcome::AlreadyApplied(v) => Some(v),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Applied(v) | Outcome::AlreadyApplied(v) => Some(v),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(r) => Some(r),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Applied(v) => Outcome::Applied(f(v)),
            Outcome::AlreadyApplied(v) => Outcome::AlreadyApplied(f(v)),
            Outcome::Rejected(r) => Outcome::Rejected(r),
        }
    }

    /// Stable label used in logs and decision records.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied(_) => "applied",
            Outcome::AlreadyApplied(_) => "ignored_duplicate",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_available_for_both_success_variants() {
        assert_eq!(Outcome::Applied(1).value(), Some(&1));
        assert_eq!(Outcome::AlreadyApplied(2).value(), Some(&2));
        let rejected: Outcome<i32> = Outcome::rejected(RejectionKind::OutOfOrder, "canceled");
        assert_eq!(rejected.value(), None);
        assert_eq!(rejected.rejection().unwrap().kind.code(), "OUT_OF_ORDER_EVENT");
    }

    #[test]
    fn map_preserves_variant() {
        let o = Outcome::AlreadyApplied(2).map(|v| v * 10);
        assert_eq!(o, Outcome::AlreadyApplied(20));
    }
}
