use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use waypost_core::{DomainError, SubscriptionId, TenantId};

use crate::cas::{CasOutcome, compare};

/// `trialing → active`, `active ⇄ past_due`, any non-terminal `→ canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(DomainError::validation(format!("unknown subscription status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    pub fn allowed_predecessors(&self) -> &'static [SubscriptionStatus] {
        use SubscriptionStatus::*;
        match self {
            Trialing => &[],
            Active => &[Trialing, PastDue],
            PastDue => &[Active],
            Canceled => &[Trialing, Active, PastDue],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSubscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub provider: String,
    pub provider_subscription_id: String,
    pub plan: String,
    pub status: SubscriptionStatus,
    /// Deferred cancellation: the provider cancels when the period ends.
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub grace_period_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Target state carried by a provider event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_end: Option<DateTime<Utc>>,
}

impl BillingSubscription {
    pub fn new(
        tenant_id: TenantId,
        provider: impl Into<String>,
        provider_subscription_id: impl Into<String>,
        plan: impl Into<String>,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let provider = provider.into();
        let provider_subscription_id = provider_subscription_id.into();
        if provider.trim().is_empty() || provider_subscription_id.trim().is_empty() {
            return Err(DomainError::validation("provider and provider_subscription_id are required"));
        }
        Ok(Self {
            id: SubscriptionId::new(),
            tenant_id,
            provider,
            provider_subscription_id,
            plan: plan.into(),
            status,
            cancel_at_period_end: false,
            current_period_end: None,
            grace_period_until: None,
            updated_at: now,
        })
    }

    /// Apply `update` if the current status allows it.
    ///
    /// Entering `past_due` opens a grace window of `grace`; returning to
    /// `active` closes it. A canceled subscription accepts nothing.
    pub fn apply_update(
        &mut self,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> CasOutcome<SubscriptionStatus> {
        let target = update.status.unwrap_or(self.status);
        let outcome = compare(self.status, target, target.allowed_predecessors());

        let status_changed = match outcome {
            CasOutcome::OutOfOrder { .. } => return outcome,
            CasOutcome::Unchanged if self.status.is_terminal() => return outcome,
            CasOutcome::Applied { .. } => true,
            CasOutcome::Unchanged => false,
        };

        let mut changed = status_changed;
        if status_changed {
            self.status = target;
            match target {
                SubscriptionStatus::PastDue => self.grace_period_until = Some(now + grace),
                SubscriptionStatus::Active => self.grace_period_until = None,
                SubscriptionStatus::Canceled => self.cancel_at_period_end = false,
                SubscriptionStatus::Trialing => {}
            }
        }

        if let Some(flag) = update.cancel_at_period_end {
            if !self.status.is_terminal() && flag != self.cancel_at_period_end {
                self.cancel_at_period_end = flag;
                changed = true;
            }
        }
        if let Some(end) = update.current_period_end {
            if self.current_period_end != Some(end) {
                self.current_period_end = Some(end);
                changed = true;
            }
        }

        if !changed {
            return CasOutcome::Unchanged;
        }
        self.updated_at = now;
        match outcome {
            CasOutcome::Applied { .. } => outcome,
            _ => CasOutcome::Applied {
                from: self.status,
                to: self.status,
            },
        }
    }

    /// Whether service should still be provided at `now`.
    pub fn in_good_standing(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Trialing | SubscriptionStatus::Active => true,
            SubscriptionStatus::PastDue => self.grace_period_until.is_some_and(|g| now < g),
            SubscriptionStatus::Canceled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(status: SubscriptionStatus) -> BillingSubscription {
        BillingSubscription::new(TenantId::new(), "stripe", "sub_1", "growth", status, Utc::now()).unwrap()
    }

    fn to(status: SubscriptionStatus) -> SubscriptionUpdate {
        SubscriptionUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn trial_converts_to_active() {
        let mut s = sub(SubscriptionStatus::Trialing);
        let out = s.apply_update(&to(SubscriptionStatus::Active), Utc::now(), Duration::days(7));
        assert!(out.is_applied());
        assert_eq!(s.status, SubscriptionStatus::Active);
    }

    #[test]
    fn payment_failure_opens_grace_and_recovery_closes_it() {
        let mut s = sub(SubscriptionStatus::Active);
        let now = Utc::now();
        s.apply_update(&to(SubscriptionStatus::PastDue), now, Duration::days(7));
        assert_eq!(s.grace_period_until, Some(now + Duration::days(7)));
        assert!(s.in_good_standing(now + Duration::days(6)));
        assert!(!s.in_good_standing(now + Duration::days(8)));

        let out = s.apply_update(&to(SubscriptionStatus::Active), now, Duration::days(7));
        assert_eq!(
            out,
            CasOutcome::Applied {
                from: SubscriptionStatus::PastDue,
                to: SubscriptionStatus::Active
            }
        );
        assert_eq!(s.grace_period_until, None);
    }

    #[test]
    fn canceled_is_terminal() {
        let mut s = sub(SubscriptionStatus::Active);
        s.apply_update(&to(SubscriptionStatus::Canceled), Utc::now(), Duration::days(7));
        let before = s.clone();

        for target in [SubscriptionStatus::Active, SubscriptionStatus::PastDue, SubscriptionStatus::Trialing] {
            let out = s.apply_update(&to(target), Utc::now(), Duration::days(7));
            assert!(matches!(out, CasOutcome::OutOfOrder { .. }));
        }
        let flag = SubscriptionUpdate {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        assert_eq!(s.apply_update(&flag, Utc::now(), Duration::days(7)), CasOutcome::Unchanged);
        assert_eq!(s, before);
    }

    #[test]
    fn regressions_are_out_of_order() {
        let mut s = sub(SubscriptionStatus::Active);
        let out = s.apply_update(&to(SubscriptionStatus::Trialing), Utc::now(), Duration::days(7));
        assert!(matches!(out, CasOutcome::OutOfOrder { .. }));

        let mut s = sub(SubscriptionStatus::Trialing);
        let out = s.apply_update(&to(SubscriptionStatus::PastDue), Utc::now(), Duration::days(7));
        assert!(matches!(out, CasOutcome::OutOfOrder { .. }));
        assert_eq!(s.status, SubscriptionStatus::Trialing);
    }

    #[test]
    fn deferred_cancellation_flag_is_an_update() {
        let mut s = sub(SubscriptionStatus::Active);
        let upd = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            cancel_at_period_end: Some(true),
            current_period_end: None,
        };
        assert!(s.apply_update(&upd, Utc::now(), Duration::days(7)).is_applied());
        assert!(s.cancel_at_period_end);
        assert_eq!(s.apply_update(&upd, Utc::now(), Duration::days(7)), CasOutcome::Unchanged);
    }
}
