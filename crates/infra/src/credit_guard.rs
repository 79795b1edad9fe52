//! Serialized credit check + reservation per agency.
//!
//! The check reads the agency's exposure from the ledger and the reservation
//! is itself a ledger posting, so both must happen under one per-agency lock.
//! Without it two reservations could each see the old exposure and jointly
//! overshoot the limit.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use waypost_core::{AccountId, AgencyId, Amount, Currency, OrgId, Outcome, SourceRef};
use waypost_credit::{CreditDecision, CreditError, CreditEvent, CreditProfile, evaluate};
use waypost_events::{AuditScope, AuditSink, emit};
use waypost_ledger::{Account, AccountType, EntryLine, LedgerPosting, PostingKey, PostingRequest};

use crate::error::EngineError;
use crate::posting_engine::PostingEngine;
use crate::store::{CreditProfileStore, StoreError};

/// Held while one agency's check + reserve runs. Dropping it releases the lock.
pub struct AgencyLockGuard {
    _held: Box<dyn Any + Send>,
}

impl AgencyLockGuard {
    pub fn new(held: impl Any + Send) -> Self {
        Self { _held: Box::new(held) }
    }
}

#[async_trait]
pub trait AgencyLocks: Send + Sync {
    async fn acquire(&self, org_id: OrgId, agency_id: AgencyId) -> Result<AgencyLockGuard, StoreError>;
}

/// Process-local locks: one async mutex per (org, agency).
#[derive(Debug, Default)]
pub struct InMemoryAgencyLocks {
    locks: Mutex<HashMap<(OrgId, AgencyId), Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryAgencyLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgencyLocks for InMemoryAgencyLocks {
    async fn acquire(&self, org_id: OrgId, agency_id: AgencyId) -> Result<AgencyLockGuard, StoreError> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| StoreError::poisoned("agency locks"))?;
            locks.entry((org_id, agency_id)).or_default().clone()
        };
        Ok(AgencyLockGuard::new(lock.lock_owned().await))
    }
}

/// What a reservation posts and how it is keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Business object reserving credit (usually the booking).
    pub source: SourceRef,
    /// Posting event tag, e.g. `CREDIT_RESERVED`.
    pub event: String,
    /// Account credited against the agency's debit.
    pub counter_account: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationOutcome {
    pub posting: LedgerPosting,
    /// `None` when the reservation was a replay and no check ran.
    pub decision: Option<CreditDecision>,
}

#[derive(Clone)]
pub struct CreditGuard {
    profiles: Arc<dyn CreditProfileStore>,
    ledger: PostingEngine,
    locks: Arc<dyn AgencyLocks>,
    audit: Arc<dyn AuditSink>,
}

impl CreditGuard {
    pub fn new(
        profiles: Arc<dyn CreditProfileStore>,
        ledger: PostingEngine,
        locks: Arc<dyn AgencyLocks>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            profiles,
            ledger,
            locks,
            audit,
        }
    }

    pub async fn upsert_profile(&self, profile: &CreditProfile) -> Result<(), EngineError> {
        Ok(self.profiles.upsert(profile).await?)
    }

    async fn profile(&self, org_id: OrgId, agency_id: AgencyId) -> Result<CreditProfile, EngineError> {
        self.profiles
            .profile(org_id, agency_id)
            .await?
            .ok_or_else(|| CreditError::ProfileNotFound(agency_id).into())
    }

    async fn agency_account(&self, org_id: OrgId, agency_id: AgencyId, currency: Currency) -> Result<Account, EngineError> {
        self.ledger
            .store()
            .find_account(org_id, AccountType::Agency, *agency_id.as_uuid(), currency)
            .await?
            .ok_or_else(|| CreditError::NoAgencyAccount { agency_id, currency }.into())
    }

    /// Current exposure: positive net debit of the agency account.
    pub async fn exposure(&self, org_id: OrgId, agency_id: AgencyId, currency: Currency) -> Result<rust_decimal::Decimal, EngineError> {
        let account = self.agency_account(org_id, agency_id, currency).await?;
        Ok(self.ledger.balance(org_id, account.id, currency).await?.exposure())
    }

    /// Check without reserving. Not serialized; the answer may be stale by the
    /// time the caller acts on it.
    pub async fn evaluate(
        &self,
        org_id: OrgId,
        agency_id: AgencyId,
        amount: Amount,
        currency: Currency,
    ) -> Result<CreditDecision, EngineError> {
        let profile = self.profile(org_id, agency_id).await?;
        let exposure = self.exposure(org_id, agency_id, currency).await?;
        Ok(evaluate(&profile, exposure, amount, currency)?)
    }

    #[instrument(skip(self, reservation), fields(source = %reservation.source, event = %reservation.event), err)]
    pub async fn check_and_reserve(
        &self,
        org_id: OrgId,
        agency_id: AgencyId,
        amount: Amount,
        currency: Currency,
        reservation: &Reservation,
    ) -> Result<Outcome<ReservationOutcome>, EngineError> {
        let key = PostingKey::new(org_id, reservation.source.clone(), reservation.event.clone())?;
        let _guard = self.locks.acquire(org_id, agency_id).await?;

        if let Some(existing) = self.ledger.posting(&key).await? {
            return Ok(Outcome::AlreadyApplied(ReservationOutcome {
                posting: existing,
                decision: None,
            }));
        }

        let profile = self.profile(org_id, agency_id).await?;
        let account = self.agency_account(org_id, agency_id, currency).await?;
        let exposure = self.ledger.balance(org_id, account.id, currency).await?.exposure();

        let decision = match evaluate(&profile, exposure, amount, currency) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(agency_id = %agency_id, code = err.code(), error = %err, "credit reservation refused");
                return Err(err.into());
            }
        };

        let request = PostingRequest::new(
            key,
            reservation.occurred_at,
            vec![
                EntryLine::debit(account.id, currency, amount).with_memo("credit reservation"),
                EntryLine::credit(reservation.counter_account, currency, amount).with_memo("credit reservation"),
            ],
        );
        let posted = self.ledger.post(request).await?;
        let posting = match posted {
            Outcome::Applied(posting) => posting,
            Outcome::AlreadyApplied(posting) => {
                return Ok(Outcome::AlreadyApplied(ReservationOutcome {
                    posting,
                    decision: None,
                }));
            }
            Outcome::Rejected(rejection) => return Ok(Outcome::Rejected(rejection)),
        };

        let scope = AuditScope::Org(org_id);
        emit(
            self.audit.as_ref(),
            scope,
            agency_id.to_string(),
            &CreditEvent::Reserved {
                agency_id,
                posting_id: posting.id,
                reservation: reservation.source.clone(),
                amount: amount.value(),
                currency,
                occurred_at: posting.created_at,
            },
        );
        if decision.soft_limit_breached {
            warn!(
                agency_id = %agency_id,
                soft_limit = %decision.soft_limit,
                projected = %decision.projected,
                %currency,
                "credit soft limit breached"
            );
            emit(
                self.audit.as_ref(),
                scope,
                agency_id.to_string(),
                &CreditEvent::SoftLimitBreached {
                    agency_id,
                    reservation: reservation.source.clone(),
                    soft_limit: decision.soft_limit,
                    projected: decision.projected,
                    currency,
                    occurred_at: posting.created_at,
                },
            );
        }
        info!(agency_id = %agency_id, posting_id = %posting.id, headroom = %decision.headroom(), "credit reserved");

        Ok(Outcome::Applied(ReservationOutcome {
            posting,
            decision: Some(decision),
        }))
    }

    /// Give back a reservation by posting its mirror under `<EVENT>_RELEASED`.
    pub async fn release(
        &self,
        org_id: OrgId,
        agency_id: AgencyId,
        reservation: &Reservation,
        occurred_at: DateTime<Utc>,
    ) -> Result<Outcome<LedgerPosting>, EngineError> {
        let key = PostingKey::new(org_id, reservation.source.clone(), reservation.event.clone())?;
        let released = format!("{}_RELEASED", reservation.event);

        let _guard = self.locks.acquire(org_id, agency_id).await?;
        let outcome = self.ledger.reverse(&key, &released, occurred_at).await?;
        if let Outcome::Applied(posting) = &outcome {
            emit(
                self.audit.as_ref(),
                AuditScope::Org(org_id),
                agency_id.to_string(),
                &CreditEvent::Released {
                    agency_id,
                    posting_id: posting.id,
                    reservation: reservation.source.clone(),
                    occurred_at,
                },
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use waypost_events::RecordingAuditSink;
    use waypost_ledger::OpenAccount;

    use crate::store::{InMemoryCreditProfileStore, InMemoryLedgerStore};

    struct Fixture {
        guard: CreditGuard,
        audit: Arc<RecordingAuditSink>,
        org: OrgId,
        agency: AgencyId,
        clearing: AccountId,
    }

    async fn fixture(limit: Decimal, soft: Decimal) -> Fixture {
        let audit = Arc::new(RecordingAuditSink::default());
        let ledger = PostingEngine::new(Arc::new(InMemoryLedgerStore::new()), audit.clone());
        let profiles = Arc::new(InMemoryCreditProfileStore::new());
        let guard = CreditGuard::new(profiles, ledger.clone(), Arc::new(InMemoryAgencyLocks::new()), audit.clone());

        let org = OrgId::new();
        let agency = AgencyId::new();
        ledger
            .open_account(OpenAccount {
                org_id: org,
                account_type: AccountType::Agency,
                code: format!("AG-{agency}"),
                currency: Currency::EUR,
                owner_id: Some(*agency.as_uuid()),
            })
            .await
            .unwrap();
        let clearing = ledger
            .open_account(OpenAccount {
                org_id: org,
                account_type: AccountType::Clearing,
                code: "CLR".into(),
                currency: Currency::EUR,
                owner_id: None,
            })
            .await
            .unwrap()
            .into_value()
            .unwrap()
            .id;
        guard
            .upsert_profile(&CreditProfile::new(org, agency, limit, soft, Currency::EUR, 30, Utc::now()).unwrap())
            .await
            .unwrap();

        Fixture {
            guard,
            audit,
            org,
            agency,
            clearing,
        }
    }

    fn reservation(f: &Fixture, booking: &str) -> Reservation {
        Reservation {
            source: SourceRef::new("booking", booking).unwrap(),
            event: "CREDIT_RESERVED".into(),
            counter_account: f.clearing,
            occurred_at: Utc::now(),
        }
    }

    fn amt(d: Decimal) -> Amount {
        Amount::new(d).unwrap()
    }

    #[tokio::test]
    async fn reservation_raises_exposure() {
        let f = fixture(dec!(1000), dec!(800)).await;
        let out = f
            .guard
            .check_and_reserve(f.org, f.agency, amt(dec!(300)), Currency::EUR, &reservation(&f, "BK-1"))
            .await
            .unwrap();
        assert!(out.is_applied());
        assert_eq!(f.guard.exposure(f.org, f.agency, Currency::EUR).await.unwrap(), dec!(300));
        assert_eq!(f.audit.of_type("credit.reserved").len(), 1);
    }

    #[tokio::test]
    async fn breach_reports_limit_exposure_and_request() {
        let f = fixture(dec!(1000), dec!(800)).await;
        f.guard
            .check_and_reserve(f.org, f.agency, amt(dec!(900)), Currency::EUR, &reservation(&f, "BK-1"))
            .await
            .unwrap();

        let err = f
            .guard
            .check_and_reserve(f.org, f.agency, amt(dec!(150)), Currency::EUR, &reservation(&f, "BK-2"))
            .await
            .unwrap_err();
        match err {
            EngineError::Credit(CreditError::LimitExceeded {
                limit,
                exposure,
                requested,
                currency,
            }) => {
                assert_eq!(limit, dec!(1000));
                assert_eq!(exposure, dec!(900));
                assert_eq!(requested, dec!(150));
                assert_eq!(currency, Currency::EUR);
            }
            other => panic!("expected limit breach, got {other:?}"),
        }
        assert_eq!(f.guard.exposure(f.org, f.agency, Currency::EUR).await.unwrap(), dec!(900));
    }

    #[tokio::test]
    async fn soft_limit_breach_is_allowed_and_flagged() {
        let f = fixture(dec!(1000), dec!(800)).await;
        let out = f
            .guard
            .check_and_reserve(f.org, f.agency, amt(dec!(850)), Currency::EUR, &reservation(&f, "BK-1"))
            .await
            .unwrap();
        let decision = out.into_value().unwrap().decision.unwrap();
        assert!(decision.soft_limit_breached);
        assert_eq!(f.audit.of_type("credit.soft_limit_breached").len(), 1);
    }

    #[tokio::test]
    async fn replayed_reservation_skips_the_limit_check() {
        let f = fixture(dec!(500), dec!(500)).await;
        let res = reservation(&f, "BK-1");
        f.guard
            .check_and_reserve(f.org, f.agency, amt(dec!(400)), Currency::EUR, &res)
            .await
            .unwrap();

        // Exposure is now 400; a fresh 400 would breach, the replay must not.
        let replay = f
            .guard
            .check_and_reserve(f.org, f.agency, amt(dec!(400)), Currency::EUR, &res)
            .await
            .unwrap();
        assert!(replay.is_already_applied());
        assert_eq!(f.guard.exposure(f.org, f.agency, Currency::EUR).await.unwrap(), dec!(400));
    }

    #[tokio::test]
    async fn release_restores_headroom() {
        let f = fixture(dec!(500), dec!(500)).await;
        let res = reservation(&f, "BK-1");
        f.guard
            .check_and_reserve(f.org, f.agency, amt(dec!(400)), Currency::EUR, &res)
            .await
            .unwrap();
        let released = f.guard.release(f.org, f.agency, &res, Utc::now()).await.unwrap();
        assert!(released.is_applied());
        assert_eq!(released.value().unwrap().event, "CREDIT_RESERVED_RELEASED");
        assert_eq!(f.guard.exposure(f.org, f.agency, Currency::EUR).await.unwrap(), dec!(0));

        let d = f.guard.evaluate(f.org, f.agency, amt(dec!(500)), Currency::EUR).await.unwrap();
        assert_eq!(d.headroom(), dec!(0));
    }

    #[tokio::test]
    async fn missing_profile_is_refused() {
        let f = fixture(dec!(500), dec!(500)).await;
        let err = f
            .guard
            .check_and_reserve(f.org, AgencyId::new(), amt(dec!(1)), Currency::EUR, &reservation(&f, "BK-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CREDIT_PROFILE_NOT_FOUND");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_cannot_jointly_exceed_the_limit() {
        let f = Arc::new(fixture(dec!(1000), dec!(1000)).await);

        let a = {
            let f = f.clone();
            tokio::spawn(async move {
                f.guard
                    .check_and_reserve(f.org, f.agency, amt(dec!(600)), Currency::EUR, &reservation(&f, "BK-A"))
                    .await
            })
        };
        let b = {
            let f = f.clone();
            tokio::spawn(async move {
                f.guard
                    .check_and_reserve(f.org, f.agency, amt(dec!(600)), Currency::EUR, &reservation(&f, "BK-B"))
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let breached = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::Credit(CreditError::LimitExceeded { .. }))))
            .count();
        assert_eq!((ok, breached), (1, 1));
        assert_eq!(f.guard.exposure(f.org, f.agency, Currency::EUR).await.unwrap(), dec!(600));
    }
}
