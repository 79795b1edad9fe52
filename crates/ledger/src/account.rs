use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use waypost_core::{AccountId, Currency, DomainError, Entity, OrgId};

/// Who or what the account represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Platform,
    Agency,
    Supplier,
    Customer,
    Clearing,
    Revenue,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Platform => "platform",
            AccountType::Agency => "agency",
            AccountType::Supplier => "supplier",
            AccountType::Customer => "customer",
            AccountType::Clearing => "clearing",
            AccountType::Revenue => "revenue",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "platform" => Ok(AccountType::Platform),
            "agency" => Ok(AccountType::Agency),
            "supplier" => Ok(AccountType::Supplier),
            "customer" => Ok(AccountType::Customer),
            "clearing" => Ok(AccountType::Clearing),
            "revenue" => Ok(AccountType::Revenue),
            other => Err(DomainError::validation(format!("unknown account type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Archived,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Archived => "archived",
        }
    }
}

/// Input for opening an account during onboarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAccount {
    pub org_id: OrgId,
    pub account_type: AccountType,
    pub code: String,
    pub currency: Currency,
    pub owner_id: Option<Uuid>,
}

/// Org-scoped ledger account. Never deleted, only archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub org_id: OrgId,
    pub account_type: AccountType,
    /// Unique per org, e.g. "AGENCY-7f3a-EUR".
    pub code: String,
    pub currency: Currency,
    pub status: AccountStatus,
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn open(cmd: OpenAccount, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let code = cmd.code.trim();
        if code.is_empty() {
            return Err(DomainError::validation("account code must not be empty"));
        }
        Ok(Self {
            id: AccountId::new(),
            org_id: cmd.org_id,
            account_type: cmd.account_type,
            code: code.to_string(),
            currency: cmd.currency,
            status: AccountStatus::Active,
            owner_id: cmd.owner_id,
            created_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Archive the account. Archiving twice is a no-op.
    pub fn archive(&mut self) {
        self.status = AccountStatus::Archived;
    }
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn org_id(&self) -> OrgId {
        self.org_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_blank_code() {
        let err = Account::open(
            OpenAccount {
                org_id: OrgId::new(),
                account_type: AccountType::Agency,
                code: "  ".into(),
                currency: Currency::EUR,
                owner_id: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn account_type_round_trips_through_str() {
        for t in [
            AccountType::Platform,
            AccountType::Agency,
            AccountType::Supplier,
            AccountType::Customer,
            AccountType::Clearing,
            AccountType::Revenue,
        ] {
            assert_eq!(AccountType::parse(t.as_str()).unwrap(), t);
        }
    }
}
