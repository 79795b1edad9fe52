//! Compare-and-swap over allowed predecessor sets.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CasOutcome<S> {
    Applied { from: S, to: S },
    /// Current state already equals the target.
    Unchanged,
    /// Current state is outside the allowed predecessors; never regressed.
    OutOfOrder { from: S, to: S },
}

impl<S> CasOutcome<S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// Whether `current → target` may be applied given `target`'s predecessors.
pub fn compare<S: Copy + PartialEq>(current: S, target: S, allowed: &[S]) -> CasOutcome<S> {
    if current == target {
        CasOutcome::Unchanged
    } else if allowed.contains(&current) {
        CasOutcome::Applied {
            from: current,
            to: target,
        }
    } else {
        CasOutcome::OutOfOrder {
            from: current,
            to: target,
        }
    }
}
