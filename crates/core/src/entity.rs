//! Entity trait: identity + continuity across state changes.

use crate::id::OrgId;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Organization that owns the entity. Stores refuse to hand an entity to a
    /// caller scoped to a different org.
    fn org_id(&self) -> OrgId;
}
