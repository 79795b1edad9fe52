use serde::{Deserialize, Serialize};

use waypost_core::{OrgId, TenantId};

/// Which boundary an audit record belongs to.
///
/// Ledger, FX and credit records are org-scoped; usage and subscription
/// records are tenant-scoped; scheduler runs are system-wide.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum AuditScope {
    Org(OrgId),
    Tenant(TenantId),
    System,
}

impl AuditScope {
    pub fn org_id(&self) -> Option<OrgId> {
        match self {
            AuditScope::Org(id) => Some(*id),
            _ => None,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            AuditScope::Tenant(id) => Some(*id),
            _ => None,
        }
    }
}
