//! Value object trait: equality by value, not identity.
//!
//! `Amount`, `Currency`, `SourceRef` and `RefundComputation` are value objects:
//! two instances with the same attributes are interchangeable.

/// Marker trait for value objects (immutable, compared by value).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
