use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{AgencyId, Currency, PostingId, SourceRef};
use waypost_events::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreditEvent {
    Reserved {
        agency_id: AgencyId,
        posting_id: PostingId,
        reservation: SourceRef,
        amount: Decimal,
        currency: Currency,
        occurred_at: DateTime<Utc>,
    },
    /// Incident: the reservation went through but crossed the warning threshold.
    SoftLimitBreached {
        agency_id: AgencyId,
        reservation: SourceRef,
        soft_limit: Decimal,
        projected: Decimal,
        currency: Currency,
        occurred_at: DateTime<Utc>,
    },
    Released {
        agency_id: AgencyId,
        posting_id: PostingId,
        reservation: SourceRef,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for CreditEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CreditEvent::Reserved { .. } => "credit.reserved",
            CreditEvent::SoftLimitBreached { .. } => "credit.soft_limit_breached",
            CreditEvent::Released { .. } => "credit.released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CreditEvent::Reserved { occurred_at, .. }
            | CreditEvent::SoftLimitBreached { occurred_at, .. }
            | CreditEvent::Released { occurred_at, .. } => *occurred_at,
        }
    }
}
