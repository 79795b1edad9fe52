//! References to the business objects that trigger money movements.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

fn non_empty(field: &str, value: String) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// The business object a posting or usage record originates from
/// (e.g. `booking/BK-1042`, `refund_case/…`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Result<Self, DomainError> {
        Ok(Self {
            kind: non_empty("source.type", kind.into())?,
            id: non_empty("source.id", id.into())?,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl core::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl ValueObject for SourceRef {}

/// Business context an FX rate gets frozen for (e.g. `booking/BK-1042`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextRef {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

impl ContextRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Result<Self, DomainError> {
        Ok(Self {
            kind: non_empty("context.type", kind.into())?,
            id: non_empty("context.id", id.into())?,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl core::fmt::Display for ContextRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl ValueObject for ContextRef {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_parts_are_rejected() {
        assert!(SourceRef::new("booking", " ").is_err());
        assert!(ContextRef::new("", "BK-1").is_err());
    }

    #[test]
    fn slashes_do_not_merge_distinct_references() {
        let left = SourceRef::new("a/b", "c").unwrap();
        let right = SourceRef::new("a", "b/c").unwrap();
        assert_eq!(left.to_string(), right.to_string());
        assert_ne!(left, right);
        assert_ne!(
            ContextRef::new("a/b", "c").unwrap(),
            ContextRef::new("a", "b/c").unwrap()
        );
    }

    #[test]
    fn parts_are_trimmed() {
        let s = SourceRef::new(" booking ", "BK-1 ").unwrap();
        assert_eq!(s.to_string(), "booking/BK-1");
    }
}
