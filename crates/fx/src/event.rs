use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use waypost_core::{ContextRef, Currency, SnapshotId};
use waypost_events::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FxEvent {
    SnapshotFrozen {
        snapshot_id: SnapshotId,
        context: ContextRef,
        base: Currency,
        quote: Currency,
        rate: Decimal,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for FxEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FxEvent::SnapshotFrozen { .. } => "fx.snapshot.frozen",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            FxEvent::SnapshotFrozen { occurred_at, .. } => *occurred_at,
        }
    }
}
