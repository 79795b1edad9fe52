use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::DomainError;

/// Absolute rounding tolerance in major currency units (0.005 = half a cent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tolerance(Decimal);

impl Tolerance {
    pub const DEFAULT: Tolerance = Tolerance(Decimal::from_parts(5, 0, 0, false, 3));

    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value.is_sign_negative() {
            return Err(DomainError::validation("tolerance must be non-negative"));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `|value| <= tolerance`.
    pub fn absorbs(&self, value: Decimal) -> bool {
        value.abs() <= self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Delta an amendment must post, or `None` when it is small enough to skip.
///
/// Amendment callers use this instead of calling the posting engine with a
/// near-zero movement.
pub fn amendment_delta(previous: Decimal, current: Decimal, tolerance: Tolerance) -> Option<Decimal> {
    let delta = current - previous;
    if tolerance.absorbs(delta) { None } else { Some(delta) }
}
